//! In-process event bus between metric producers and live observers.

use pulse_types::MetricRecord;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::registry::{BroadcastReport, ConnectionRegistry, Frame};

/// Diagnostics for a single [`EventBus::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Bus-wide sequence number assigned to the event (starts at 1).
    pub sequence: u64,
    pub delivered: usize,
    pub dropped: usize,
}

struct BusInner {
    registry: ConnectionRegistry,
    sequence: AtomicU64,
    /// Serializes fan-out passes so concurrent publishers cannot interleave
    /// their deliveries differently across observers.
    fan_out: Mutex<()>,
}

/// Accepts metric events and fans them out to every registered observer.
///
/// `publish` never awaits and never fails from the caller's point of view:
/// per-observer delivery failures are handled inside the registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry,
                sequence: AtomicU64::new(0),
                fan_out: Mutex::new(()),
            }),
        }
    }

    /// Publishes a persisted record as a `{type, data}` envelope.
    ///
    /// The envelope is serialized once and shared by every observer queue.
    pub fn publish(&self, record: &MetricRecord) -> PublishReport {
        let frame: Frame = match serde_json::to_string(&record.to_envelope()) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                tracing::error!(
                    record_id = record.id(),
                    kind = record.kind().as_str(),
                    "failed to serialize envelope: {}",
                    e
                );
                return PublishReport::default();
            }
        };

        let _guard = self.inner.fan_out.lock().unwrap_or_else(|poisoned| {
            tracing::error!("event bus fan-out lock poisoned, recovering");
            poisoned.into_inner()
        });
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let BroadcastReport { delivered, dropped } = self.inner.registry.broadcast(frame);

        tracing::trace!(
            sequence,
            record_id = record.id(),
            subject_id = record.subject_id(),
            kind = record.kind().as_str(),
            delivered,
            dropped,
            "published metric event"
        );

        PublishReport {
            sequence,
            delivered,
            dropped,
        }
    }

    /// Number of events published so far. Diagnostic only.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("sequence", &self.sequence())
            .field("observers", &self.inner.registry.len())
            .finish()
    }
}
