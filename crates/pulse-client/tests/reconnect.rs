//! Reconnect loop tests against an in-process WebSocket server.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use pulse_client::{
    CatchUp, ClientConfig, ClientError, ClientEvent, ClientState, ReconnectPolicy,
    ReconnectingClient,
};
use pulse_types::{Envelope, MetricKind, MetricRecord, Payload, ReadyFrame};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

fn envelope(id: i64) -> Envelope {
    let mut payload = Payload::new();
    payload.insert("hashrate".into(), json!(100.0 + id as f64));
    MetricRecord::from_parts(id, MetricKind::Stats, 1, Utc::now(), payload).to_envelope()
}

fn frame(id: i64) -> Message {
    Message::Text(serde_json::to_string(&envelope(id)).unwrap().into())
}

fn ready() -> Message {
    Message::Text(serde_json::to_string(&ReadyFrame::new("observer-1")).unwrap().into())
}

/// Never answers.
struct StalledCatchUp;

impl CatchUp for StalledCatchUp {
    async fn recent(&self, _subject_id: i64, _limit: usize) -> Result<Vec<Envelope>, ClientError> {
        std::future::pending().await
    }
}

/// Serves canned history, newest first.
#[derive(Clone, Default)]
struct StubCatchUp {
    history: Arc<Mutex<Vec<Envelope>>>,
    calls: Arc<AtomicUsize>,
}

impl StubCatchUp {
    fn set_history(&self, ids: &[i64]) {
        *self.history.lock().unwrap() = ids.iter().map(|id| envelope(*id)).collect();
    }
}

impl CatchUp for StubCatchUp {
    async fn recent(&self, _subject_id: i64, limit: usize) -> Result<Vec<Envelope>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let history = self.history.lock().unwrap();
        Ok(history.iter().take(limit).cloned().collect())
    }
}

/// Accepts connections and hands each one's frames to the script for that
/// connection index. After the script runs the connection is closed.
async fn spawn_scripted_server(scripts: Vec<Vec<Message>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    serve_scripts(listener, scripts)
}

fn serve_scripts(listener: TcpListener, scripts: Vec<Vec<Message>>) -> SocketAddr {
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        for script in scripts {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            for msg in script {
                ws.send(msg).await.unwrap();
            }
            let _ = ws.send(Message::Close(None)).await;
            while let Some(Ok(_)) = ws.next().await {}
        }
        // Later reconnects complete TCP but never get a handshake.
        std::future::pending::<()>().await;
    });

    addr
}

fn config(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(format!("ws://{}/ws", addr), vec![1]);
    config.reconnect = ReconnectPolicy::fixed(Duration::from_millis(50));
    config
}

async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event should arrive")
        .expect("event channel should stay open")
}

#[tokio::test]
async fn catch_up_precedes_live_and_duplicates_are_dropped() {
    let addr = spawn_scripted_server(vec![vec![
        ready(),
        frame(3),
        Message::Text("{not json".into()),
        frame(4),
        frame(4),
        frame(5),
    ]])
    .await;

    let catch_up = StubCatchUp::default();
    catch_up.set_history(&[3, 2, 1]);

    let (handle, mut events) = ReconnectingClient::spawn(config(addr), catch_up.clone());

    let mut received = Vec::new();
    for _ in 0..5 {
        received.push(next_event(&mut events).await);
    }

    let ids: Vec<(bool, i64)> = received
        .iter()
        .map(|e| (matches!(e, ClientEvent::Live(_)), e.envelope().data.id()))
        .collect();
    assert_eq!(
        ids,
        vec![(false, 1), (false, 2), (false, 3), (true, 4), (true, 5)]
    );
    assert_eq!(catch_up.calls.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

#[tokio::test]
async fn reconnects_after_drop_and_backfills_gap() {
    let addr = spawn_scripted_server(vec![vec![ready(), frame(1)], vec![ready(), frame(4)]]).await;

    let catch_up = StubCatchUp::default();
    let mut config = config(addr);
    config.reconnect = ReconnectPolicy::fixed(Duration::from_millis(300));
    let (handle, mut events) = ReconnectingClient::spawn(config, catch_up.clone());

    let first = next_event(&mut events).await;
    assert!(matches!(first, ClientEvent::Live(_)));
    assert_eq!(first.envelope().data.id(), 1);

    // Records 2 and 3 were published while the client was away.
    catch_up.set_history(&[3, 2, 1]);

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_event(&mut events).await.envelope().data.id());
    }
    assert_eq!(seen, vec![2, 3, 4]);
    assert_eq!(catch_up.calls.load(Ordering::SeqCst), 2);

    handle.stop().await;
}

#[tokio::test]
async fn keeps_retrying_until_server_comes_up() {
    // Bind then drop to get a port nobody is listening on yet.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let catch_up = StubCatchUp::default();
    let (handle, mut events) = ReconnectingClient::spawn(config(addr), catch_up.clone());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_ne!(handle.state(), ClientState::Connected);
    assert_eq!(catch_up.calls.load(Ordering::SeqCst), 0);

    let listener = TcpListener::bind(addr).await.unwrap();
    serve_scripts(listener, vec![vec![ready(), frame(9)]]);

    let event = next_event(&mut events).await;
    assert_eq!(event.envelope().data.id(), 9);
    assert_eq!(catch_up.calls.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

#[tokio::test]
async fn stop_ends_loop_in_disconnected_state() {
    let addr = spawn_scripted_server(vec![vec![ready(), frame(1)]]).await;

    let (handle, mut events) = ReconnectingClient::spawn(config(addr), StubCatchUp::default());
    let states = handle.watch_state();
    next_event(&mut events).await;

    handle.stop().await;
    assert_eq!(*states.borrow(), ClientState::Disconnected);
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn catch_up_waits_for_ready_frame() {
    // The first connection pushes data without a ready frame and is dropped.
    let addr = spawn_scripted_server(vec![vec![frame(1)], vec![ready(), frame(2)]]).await;

    let catch_up = StubCatchUp::default();
    let (handle, mut events) = ReconnectingClient::spawn(config(addr), catch_up.clone());

    let event = next_event(&mut events).await;
    assert!(matches!(event, ClientEvent::Live(_)));
    assert_eq!(event.envelope().data.id(), 2);
    assert_eq!(catch_up.calls.load(Ordering::SeqCst), 1);

    handle.stop().await;
}

#[tokio::test]
async fn stop_returns_while_consumer_is_not_reading() {
    let mut script = vec![ready()];
    script.extend((1..=10).map(frame));
    let addr = spawn_scripted_server(vec![script]).await;

    let mut config = config(addr);
    config.event_capacity = 2;
    let (handle, mut events) = ReconnectingClient::spawn(config, StubCatchUp::default());

    let mut states = handle.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ClientState::Connected),
    )
    .await
    .expect("client should connect")
    .unwrap();
    // Let the event channel fill up while nobody reads it.
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(3), handle.stop())
        .await
        .expect("stop should not wait on the consumer");

    let mut buffered = Vec::new();
    while let Some(event) = events.recv().await {
        buffered.push(event.envelope().data.id());
    }
    assert_eq!(buffered, vec![1, 2]);
}

#[tokio::test]
async fn stop_interrupts_pending_catch_up() {
    let addr = spawn_scripted_server(vec![vec![ready(), frame(1)]]).await;

    let (handle, mut events) = ReconnectingClient::spawn(config(addr), StalledCatchUp);

    let mut states = handle.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ClientState::Connected),
    )
    .await
    .expect("client should connect")
    .unwrap();

    tokio::time::timeout(Duration::from_secs(3), handle.stop())
        .await
        .expect("stop should not wait on catch-up");
    assert!(events.recv().await.is_none());
}
