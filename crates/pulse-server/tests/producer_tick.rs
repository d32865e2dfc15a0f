//! Producer loop tests: persisted-then-published ticks and store failures.

use pulse_db::{create_pool, run_migrations, DbRuntimeSettings};
use pulse_server::bus::EventBus;
use pulse_server::producer::{ProducerLoop, SnapshotSource};
use pulse_server::registry::{ConnectionRegistry, Frame};
use pulse_store::{MetricStore, SqliteMetricStore, StoreError};
use pulse_types::{Envelope, MetricKind, MetricRecord, NewMetric, Payload};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

fn file_store() -> (TempDir, Arc<SqliteMetricStore>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulse.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
    }
    (dir, Arc::new(SqliteMetricStore::new(pool)))
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

/// Returns the same drafts on every tick.
struct FixedSource(Vec<NewMetric>);

impl SnapshotSource for FixedSource {
    fn snapshot(&mut self, subject_id: i64) -> Vec<NewMetric> {
        self.0
            .iter()
            .map(|d| NewMetric::new(d.kind, subject_id, d.payload.clone()))
            .collect()
    }
}

/// A store whose writes always fail.
#[derive(Default)]
struct FailingStore {
    appends: AtomicUsize,
}

impl MetricStore for FailingStore {
    fn append(&self, _draft: &NewMetric) -> Result<MetricRecord, StoreError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("disk full".into()))
    }

    fn recent(
        &self,
        _subject_id: i64,
        _kind: Option<MetricKind>,
        _limit: usize,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        Ok(Vec::new())
    }
}

fn observer(registry: &ConnectionRegistry) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel(64);
    registry.register(tx).unwrap();
    rx
}

#[tokio::test]
async fn test_tick_persists_then_publishes_to_every_observer() {
    let (_dir, store) = file_store();
    let registry = ConnectionRegistry::new();
    let bus = EventBus::new(registry.clone());
    let mut first = observer(&registry);
    let mut second = observer(&registry);

    let source = FixedSource(vec![NewMetric::new(
        MetricKind::Stats,
        1,
        payload(json!({ "hashrate": 145.7, "sharesSubmitted": 3 })),
    )]);
    let mut producer = ProducerLoop::new(
        store.clone(),
        bus.clone(),
        Box::new(source),
        vec![1],
        Duration::from_secs(5),
    );

    let report = producer.tick().await;
    assert_eq!(report.published, 1);
    assert_eq!(report.failed_subjects, 0);

    let latest = store.latest(1, None).unwrap().expect("record should be persisted");
    assert_eq!(latest.kind(), MetricKind::Stats);
    assert_eq!(latest.field("hashrate"), Some(&json!(145.7)));
    assert_eq!(latest.field("sharesSubmitted"), Some(&json!(3)));

    for rx in [&mut first, &mut second] {
        let frame = rx.try_recv().expect("observer should receive the event");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "stats");
        assert_eq!(value["data"]["hashrate"], json!(145.7));
        assert_eq!(value["data"]["sharesSubmitted"], json!(3));
        assert_eq!(value["data"]["subjectId"], json!(1));
        assert_eq!(value["data"]["id"], json!(latest.id()));
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_tick_covers_every_subject() {
    let (_dir, store) = file_store();
    let registry = ConnectionRegistry::new();
    let mut rx = observer(&registry);

    let source = FixedSource(vec![
        NewMetric::new(MetricKind::Stats, 0, payload(json!({ "hashrate": 1.0 }))),
        NewMetric::new(MetricKind::Hardware, 0, payload(json!({ "gpuName": "gpu" }))),
    ]);
    let mut producer = ProducerLoop::new(
        store.clone(),
        EventBus::new(registry.clone()),
        Box::new(source),
        vec![1, 2, 3],
        Duration::from_secs(5),
    );

    assert_eq!(producer.tick().await.published, 6);
    for subject in 1..=3 {
        assert_eq!(store.recent(subject, None, 10).unwrap().len(), 2);
    }

    let mut kinds = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let envelope: Envelope = serde_json::from_str(&frame).unwrap();
        kinds.push((envelope.data.subject_id(), envelope.kind));
    }
    assert_eq!(kinds.len(), 6);
    assert_eq!(kinds[0], (1, "stats".to_string()));
    assert_eq!(kinds[1], (1, "hardware".to_string()));
}

#[tokio::test]
async fn test_invalid_draft_skips_rest_of_subject_tick() {
    let (_dir, store) = file_store();
    let registry = ConnectionRegistry::new();
    let mut rx = observer(&registry);

    // The first draft is missing `hashrate`; the second must not be written.
    let source = FixedSource(vec![
        NewMetric::new(MetricKind::Stats, 0, payload(json!({ "sharesSubmitted": 1 }))),
        NewMetric::new(MetricKind::Hardware, 0, payload(json!({ "gpuName": "gpu" }))),
    ]);
    let mut producer = ProducerLoop::new(
        store.clone(),
        EventBus::new(registry.clone()),
        Box::new(source),
        vec![1],
        Duration::from_secs(5),
    );

    let report = producer.tick().await;
    assert_eq!(report.published, 0);
    assert_eq!(report.failed_subjects, 1);
    assert!(store.recent(1, None, 10).unwrap().is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_store_failure_never_publishes() {
    let store = Arc::new(FailingStore::default());
    let registry = ConnectionRegistry::new();
    let bus = EventBus::new(registry.clone());
    let mut rx = observer(&registry);

    let source = FixedSource(vec![
        NewMetric::new(MetricKind::Stats, 0, payload(json!({ "hashrate": 1.0 }))),
        NewMetric::new(MetricKind::Hardware, 0, payload(json!({ "gpuName": "gpu" }))),
    ]);
    let mut producer = ProducerLoop::new(
        store.clone(),
        bus.clone(),
        Box::new(source),
        vec![1, 2],
        Duration::from_secs(5),
    );

    let report = producer.tick().await;
    assert_eq!(report.published, 0);
    assert_eq!(report.failed_subjects, 2);
    // One attempt per subject: the second draft of each subject is skipped.
    assert_eq!(store.appends.load(Ordering::SeqCst), 2);
    assert_eq!(bus.sequence(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_loop_keeps_running_after_store_failures() {
    let store = Arc::new(FailingStore::default());
    let registry = ConnectionRegistry::new();
    let bus = EventBus::new(registry.clone());

    let source = FixedSource(vec![NewMetric::new(
        MetricKind::Stats,
        0,
        payload(json!({ "hashrate": 1.0 })),
    )]);
    let mut producer = ProducerLoop::new(
        store.clone(),
        bus.clone(),
        Box::new(source),
        vec![1],
        Duration::from_secs(5),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        producer.run(shutdown_rx).await;
    });

    // Appends run on the blocking pool, so poll until three ticks have landed.
    let mut waited = 0;
    while store.appends.load(Ordering::SeqCst) < 3 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        waited += 1;
        assert!(waited < 120, "producer loop stopped ticking");
    }

    shutdown_tx.send(true).unwrap();
    task.await.expect("producer loop should exit cleanly");
    assert_eq!(bus.sequence(), 0);
}
