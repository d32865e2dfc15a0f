//! Lifecycle of the background telemetry pipeline.

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::producer::ProducerLoop;
use crate::registry::ConnectionRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("telemetry service is already running")]
    AlreadyRunning,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<ProducerLoop>>,
}

/// Owns the producer loop task and the live observer set.
///
/// Nothing runs until [`start`](Self::start) is called. [`stop`](Self::stop)
/// halts the loop, waits for an in-flight tick to finish, and then closes
/// every observer connection. A stopped service can be started again.
pub struct TelemetryService {
    registry: ConnectionRegistry,
    producer: Option<ProducerLoop>,
    running: Option<Running>,
}

impl TelemetryService {
    /// `producer` is `None` when the built-in loop is disabled; the service
    /// then only manages observer shutdown.
    pub fn new(registry: ConnectionRegistry, producer: Option<ProducerLoop>) -> Self {
        Self {
            registry,
            producer,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn start(&mut self) -> Result<(), ServiceError> {
        if self.running.is_some() {
            return Err(ServiceError::AlreadyRunning);
        }

        let (shutdown, rx) = watch::channel(false);
        let task = self.producer.take().map(|mut producer| {
            tokio::spawn(async move {
                producer.run(rx).await;
                producer
            })
        });

        if task.is_none() {
            tracing::info!("producer loop disabled, serving ingest and catch-up only");
        }

        self.running = Some(Running { shutdown, task });
        tracing::info!("telemetry service started");
        Ok(())
    }

    /// Stops the service. Returns the number of observers that were closed.
    ///
    /// Calling `stop` on a service that is not running still closes any
    /// registered observers.
    pub async fn stop(&mut self) -> usize {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            if let Some(task) = running.task {
                match task.await {
                    Ok(producer) => self.producer = Some(producer),
                    Err(e) => tracing::error!("producer loop task join error: {}", e),
                }
            }
        }

        let closed = self.registry.close_all();
        tracing::info!(closed_observers = closed, "telemetry service stopped");
        closed
    }
}

impl std::fmt::Debug for TelemetryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryService")
            .field("running", &self.is_running())
            .field("observers", &self.registry.len())
            .finish()
    }
}
