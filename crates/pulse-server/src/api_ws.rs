//! Live channel: one WebSocket per observer.
//!
//! The server only pushes. The first frame on every connection is a
//! `{type:"hello", data:{observerId}}` ready frame, sent once the observer is
//! registered. Every published event after that arrives as a text frame
//! holding a `{type, data}` envelope. Inbound frames are ignored apart from
//! close.

use crate::registry::{ConnectionRegistry, Frame, ObserverId};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, StreamExt};
use pulse_types::ReadyFrame;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handler for `GET /ws`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// How a connection's writer finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterEnd {
    /// The registry dropped the queue. A close frame was attempted.
    QueueClosed,
    /// The socket rejected a write.
    WriteFailed,
    /// A single write exceeded the write timeout.
    TimedOut,
}

/// Drains an observer's queue into its socket.
///
/// Each write is bounded by `write_timeout`, including the closing frame.
/// A failed or timed-out write is a delivery failure: the observer is
/// unregistered before this returns.
pub async fn forward_frames<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Frame>,
    registry: ConnectionRegistry,
    observer_id: ObserverId,
    write_timeout: Duration,
) -> WriterEnd
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = queue.recv().await {
        let write = sink.send(Message::Text(frame.as_ref().into()));
        let end = match tokio::time::timeout(write_timeout, write).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => {
                tracing::debug!(observer_id = %observer_id, "socket write failed: {}", e);
                WriterEnd::WriteFailed
            }
            Err(_) => {
                tracing::warn!(
                    observer_id = %observer_id,
                    timeout_ms = write_timeout.as_millis() as u64,
                    "socket write timed out"
                );
                WriterEnd::TimedOut
            }
        };
        registry.unregister_id(observer_id);
        return end;
    }

    // Queue closed by the registry.
    let close = sink.send(Message::Close(None));
    if tokio::time::timeout(write_timeout, close).await.is_err() {
        tracing::debug!(observer_id = %observer_id, "close frame timed out");
    }
    WriterEnd::QueueClosed
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // The registry holds the only sender. Dropping it (unregister or
    // close_all) ends the writer after it drains what is already queued.
    let (tx, rx) = mpsc::channel::<Frame>(state.broadcast.channel_capacity);

    let observer = match state.registry.register(tx) {
        Ok(observer) => observer,
        Err(e) => {
            tracing::warn!("failed to register observer: {}", e);
            return;
        }
    };
    let observer_id = observer.id;
    let write_timeout = state.broadcast.write_timeout();

    // Records published from here on wait in the queue until the ready
    // frame is out.
    let ready = match serde_json::to_string(&ReadyFrame::new(observer_id)) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("failed to encode ready frame: {}", e);
            state.registry.unregister(&observer);
            return;
        }
    };
    match tokio::time::timeout(write_timeout, sender.send(Message::Text(ready.into()))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::debug!(observer_id = %observer_id, "failed to send ready frame: {}", e);
            state.registry.unregister(&observer);
            return;
        }
        Err(_) => {
            tracing::warn!(observer_id = %observer_id, "ready frame timed out");
            state.registry.unregister(&observer);
            return;
        }
    }
    tracing::info!(observer_id = %observer_id, "observer connected");

    let mut send_task = tokio::spawn(forward_frames(
        sender,
        rx,
        state.registry.clone(),
        observer_id,
        write_timeout,
    ));

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.registry.unregister(&observer);
    tracing::info!(observer_id = %observer_id, "observer disconnected");
}
