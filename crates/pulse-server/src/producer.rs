//! Periodic producer loop.
//!
//! Each tick asks a [`SnapshotSource`] for one snapshot per configured
//! subject, persists every draft through the metric store, and publishes
//! the persisted record on the event bus. A draft that fails to persist is
//! never published, and neither is anything after it for that subject in
//! the same tick.

use pulse_store::MetricStore;
use pulse_types::{MetricKind, NewMetric, Payload};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::bus::EventBus;

/// Supplies metric drafts for a subject. Collection itself is external to
/// this service; implementations adapt whatever collector is in use.
pub trait SnapshotSource: Send + 'static {
    fn snapshot(&mut self, subject_id: i64) -> Vec<NewMetric>;
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records persisted and published.
    pub published: usize,
    /// Subjects whose tick stopped early because a write failed.
    pub failed_subjects: usize,
}

/// Drives snapshot collection at a fixed cadence.
pub struct ProducerLoop {
    store: Arc<dyn MetricStore>,
    bus: EventBus,
    source: Box<dyn SnapshotSource>,
    subjects: Vec<i64>,
    interval: Duration,
}

impl ProducerLoop {
    pub fn new(
        store: Arc<dyn MetricStore>,
        bus: EventBus,
        source: Box<dyn SnapshotSource>,
        subjects: Vec<i64>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            source,
            subjects,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a single tick for every subject.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();

        for subject_id in self.subjects.clone() {
            for draft in self.source.snapshot(subject_id) {
                let store = Arc::clone(&self.store);
                let kind = draft.kind;
                let result = tokio::task::spawn_blocking(move || store.append(&draft)).await;

                match result {
                    Ok(Ok(record)) => {
                        self.bus.publish(&record);
                        report.published += 1;
                    }
                    Ok(Err(e)) => {
                        tracing::error!(
                            subject_id,
                            kind = kind.as_str(),
                            error = %e,
                            "failed to persist snapshot, skipping publish for this tick"
                        );
                        report.failed_subjects += 1;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            subject_id,
                            error = %e,
                            "snapshot append task panicked or was cancelled"
                        );
                        report.failed_subjects += 1;
                        break;
                    }
                }
            }
        }

        report
    }

    /// Ticks at the configured cadence until `shutdown` flips to `true` or
    /// its sender is dropped.
    ///
    /// The first tick happens one interval after the call. A tick that runs
    /// long delays the next one rather than bunching ticks together.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            subjects = ?self.subjects,
            "starting producer loop"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.failed_subjects > 0 {
                        tracing::warn!(
                            failed_subjects = report.failed_subjects,
                            published = report.published,
                            "producer tick completed with failures"
                        );
                    } else {
                        tracing::debug!(published = report.published, "producer tick completed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("producer loop stopped");
    }
}

impl std::fmt::Debug for ProducerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerLoop")
            .field("subjects", &self.subjects)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Synthetic stand-in for a real collector.
///
/// Emits one STATS and one HARDWARE draft per subject with values that
/// fluctuate around fixed baselines. The numbers are random and mean
/// nothing; it exists so the service has live traffic without a collector.
pub struct SyntheticSource {
    rng: StdRng,
}

impl SyntheticSource {
    const BASE_HASHRATE: f64 = 145.7;
    const BASE_EARNINGS: f64 = 0.0847;
    const GPU_NAME: &'static str = "RTX 4080 - GPU 1";

    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic source for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn jitter(&mut self, spread: f64) -> f64 {
        (self.rng.gen::<f64>() - 0.5) * spread
    }
}

impl Default for SyntheticSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for SyntheticSource {
    fn snapshot(&mut self, subject_id: i64) -> Vec<NewMetric> {
        let hashrate = Self::BASE_HASHRATE + self.jitter(10.0);
        let earnings = Self::BASE_EARNINGS + self.jitter(0.01);
        let submitted: i64 = self.rng.gen_range(0..10);
        let accepted: i64 = self.rng.gen_range(0..=submitted);

        let stats = into_payload(json!({
            "hashrate": hashrate,
            "sharesSubmitted": submitted,
            "sharesAccepted": accepted,
            "dailyEarnings": earnings,
        }));

        let device_hashrate = 72.3 + self.jitter(5.0);
        let hardware = into_payload(json!({
            "gpuName": Self::GPU_NAME,
            "temperature": 65 + self.rng.gen_range(0..10),
            "powerUsage": 240 + self.rng.gen_range(0..20),
            "fanSpeed": 75 + self.rng.gen_range(0..10),
            "hashrate": device_hashrate,
            "status": "online",
        }));

        vec![
            NewMetric::new(MetricKind::Stats, subject_id, stats),
            NewMetric::new(MetricKind::Hardware, subject_id, hardware),
        ]
    }
}

fn into_payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}
