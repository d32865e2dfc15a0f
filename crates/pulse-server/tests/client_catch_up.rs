//! End-to-end: the reconnecting client against a live server.
//!
//! Records published while the client is disconnected must reach it through
//! catch-up, and nothing may be delivered twice.

use pulse_client::{
    CatchUp, ClientConfig, ClientError, ClientEvent, HttpCatchUp, ReconnectPolicy,
    ReconnectingClient,
};
use pulse_db::{create_pool, run_migrations, DbRuntimeSettings};
use pulse_server::config::BroadcastConfig;
use pulse_server::registry::ConnectionRegistry;
use pulse_server::{app, AppState};
use pulse_store::{MetricStore, SqliteMetricStore};
use pulse_types::{Envelope, MetricKind, NewMetric};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

async fn spawn_server() -> (TempDir, SocketAddr, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pulse.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
    }
    let state = AppState::new(
        Arc::new(SqliteMetricStore::new(pool)),
        BroadcastConfig::default(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (dir, addr, state)
}

/// Persists and publishes one STATS record, returning its id.
async fn produce(state: &AppState, n: i64) -> i64 {
    let store = state.store.clone();
    let record = tokio::task::spawn_blocking(move || {
        let payload = json!({ "hashrate": 140.0 + n as f64, "sharesSubmitted": n })
            .as_object()
            .cloned()
            .unwrap();
        store.append(&NewMetric::new(MetricKind::Stats, 1, payload))
    })
    .await
    .unwrap()
    .unwrap();
    state.bus.publish(&record);
    record.id()
}

async fn wait_for_observers(state: &AppState, n: usize) {
    for _ in 0..250 {
        if state.registry.len() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} observers, found {}", n, state.registry.len());
}

async fn collect_until(
    events: &mut mpsc::Receiver<ClientEvent>,
    received: &mut Vec<ClientEvent>,
    last_id: i64,
) {
    while received.last().map(|e| e.envelope().data.id()) != Some(last_id) {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("expected more events")
            .expect("client stopped unexpectedly");
        received.push(event);
    }
}

#[tokio::test]
async fn test_gap_is_backfilled_without_duplicates() {
    let (_dir, addr, state) = spawn_server().await;

    let mut expected = Vec::new();
    for n in 0..3 {
        expected.push(produce(&state, n).await);
    }

    let mut config = ClientConfig::new(format!("ws://{}/ws", addr), vec![1]);
    config.reconnect = ReconnectPolicy::fixed(Duration::from_millis(200));
    let (handle, mut events) =
        ReconnectingClient::spawn(config, HttpCatchUp::new(format!("http://{}", addr)));

    let mut received = Vec::new();
    collect_until(&mut events, &mut received, expected[2]).await;
    assert!(received.iter().all(|e| matches!(e, ClientEvent::CatchUp(_))));
    wait_for_observers(&state, 1).await;

    for n in 3..5 {
        expected.push(produce(&state, n).await);
    }
    collect_until(&mut events, &mut received, expected[4]).await;

    // Drop the connection and publish into the gap.
    state.registry.close_all();
    for n in 5..8 {
        expected.push(produce(&state, n).await);
    }

    wait_for_observers(&state, 1).await;
    for n in 8..10 {
        expected.push(produce(&state, n).await);
    }
    collect_until(&mut events, &mut received, expected[9]).await;

    let ids: Vec<i64> = received.iter().map(|e| e.envelope().data.id()).collect();
    assert_eq!(ids, expected, "every record exactly once, in order");

    // Nothing else trickles in afterwards.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), events.recv())
            .await
            .is_err()
    );

    handle.stop().await;
}

/// HTTP catch-up that records whether the server had registered any
/// observer at the moment each request was made.
struct RegistryCheckedCatchUp {
    inner: HttpCatchUp,
    registry: ConnectionRegistry,
    calls: Arc<AtomicUsize>,
    before_registration: Arc<AtomicUsize>,
}

impl CatchUp for RegistryCheckedCatchUp {
    async fn recent(&self, subject_id: i64, limit: usize) -> Result<Vec<Envelope>, ClientError> {
        if self.registry.is_empty() {
            self.before_registration.fetch_add(1, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.recent(subject_id, limit).await
    }
}

#[tokio::test]
async fn test_catch_up_runs_only_after_server_registration() {
    let (_dir, addr, state) = spawn_server().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let before_registration = Arc::new(AtomicUsize::new(0));

    for round in 1..=25 {
        let catch_up = RegistryCheckedCatchUp {
            inner: HttpCatchUp::new(format!("http://{}", addr)),
            registry: state.registry.clone(),
            calls: calls.clone(),
            before_registration: before_registration.clone(),
        };
        let config = ClientConfig::new(format!("ws://{}/ws", addr), vec![1]);
        let (handle, _events) = ReconnectingClient::spawn(config, catch_up);

        for _ in 0..250 {
            if calls.load(Ordering::SeqCst) == round {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), round, "catch-up should run once per connect");

        handle.stop().await;
        wait_for_observers(&state, 0).await;
    }

    assert_eq!(before_registration.load(Ordering::SeqCst), 0);
}
