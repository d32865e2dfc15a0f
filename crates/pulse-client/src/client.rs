//! The reconnect loop.
//!
//! One background task owns the socket. Each time it connects it waits for
//! the server's ready frame, replays recent history for every tracked
//! subject (oldest first), and then forwards live envelopes. Records seen
//! through both paths are delivered once. When the socket drops, exactly
//! one reconnect attempt is scheduled after the policy's delay, and this
//! repeats until the handle is stopped.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pulse_types::{Envelope, ReadyFrame};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};

use crate::catch_up::CatchUp;
use crate::dedup::SeenWindow;
use crate::error::ClientError;

type LiveSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of a [`ReconnectingClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay between a disconnect and the next connection attempt.
///
/// With no multiplier the delay is constant. With a multiplier, the n-th
/// consecutive failed attempt waits `delay * multiplier^n`, capped by
/// `max_delay`. The count resets after every successful connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub multiplier: Option<f64>,
    pub max_delay: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            multiplier: None,
            max_delay: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn exponential(delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            delay,
            multiplier: Some(multiplier),
            max_delay: Some(max_delay),
        }
    }

    /// Delay before the attempt that follows `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let delay = match self.multiplier {
            Some(m) if m > 1.0 && failures > 0 => {
                let factor = m.powi(failures.min(i32::MAX as u32) as i32);
                let secs = self.delay.as_secs_f64() * factor;
                if secs.is_finite() && secs < u64::MAX as f64 {
                    Duration::from_secs_f64(secs)
                } else {
                    Duration::MAX
                }
            }
            _ => self.delay,
        };
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Live channel URL, e.g. `ws://127.0.0.1:3000/ws`.
    pub ws_url: String,
    /// Subjects replayed through catch-up on every connect.
    pub subjects: Vec<i64>,
    /// Records requested per subject during catch-up.
    pub catch_up_limit: usize,
    pub reconnect: ReconnectPolicy,
    /// How many recent record ids are remembered for duplicate suppression.
    pub dedup_window: usize,
    /// Capacity of the event channel handed back by [`ReconnectingClient::spawn`].
    pub event_capacity: usize,
    /// How long to wait for the server's ready frame after connecting.
    pub ready_timeout: Duration,
}

impl ClientConfig {
    pub fn new(ws_url: impl Into<String>, subjects: Vec<i64>) -> Self {
        Self {
            ws_url: ws_url.into(),
            subjects,
            catch_up_limit: 24,
            reconnect: ReconnectPolicy::default(),
            dedup_window: 4096,
            event_capacity: 1024,
            ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Something the client delivers to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A record replayed from history after a (re)connect.
    CatchUp(Envelope),
    /// A record pushed live by the server.
    Live(Envelope),
}

impl ClientEvent {
    pub fn envelope(&self) -> &Envelope {
        match self {
            ClientEvent::CatchUp(e) | ClientEvent::Live(e) => e,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            ClientEvent::CatchUp(e) | ClientEvent::Live(e) => e,
        }
    }
}

/// Decodes a live frame into an envelope.
pub fn decode_frame(text: &str) -> Result<Envelope, ClientError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.metric_kind() != Some(envelope.data.kind()) {
        return Err(ClientError::KindMismatch {
            label: envelope.kind.clone(),
            kind: envelope.data.kind().to_string(),
        });
    }
    Ok(envelope)
}

/// Handle to a running client task.
pub struct ClientHandle {
    state: watch::Receiver<ClientState>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    /// Current connection state.
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// Stops the loop, closes the socket, and waits for the task to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("client task join error: {}", e);
        }
    }
}

/// Entry point for starting a client.
pub struct ReconnectingClient;

impl ReconnectingClient {
    /// Spawns the reconnect loop. Events arrive on the returned receiver;
    /// dropping the receiver stops the loop.
    pub fn spawn<C: CatchUp>(
        config: ClientConfig,
        catch_up: C,
    ) -> (ClientHandle, mpsc::Receiver<ClientEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = Worker {
            seen: SeenWindow::new(config.dedup_window),
            config,
            catch_up,
            events: event_tx,
            state: state_tx,
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run());

        (
            ClientHandle {
                state: state_rx,
                stop: stop_tx,
                task,
            },
            event_rx,
        )
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// The socket closed or failed; reconnect.
    Dropped,
    /// Stop requested or the consumer went away; exit.
    Shutdown,
}

struct Worker<C> {
    config: ClientConfig,
    catch_up: C,
    seen: SeenWindow,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<ClientState>,
    stop: watch::Receiver<bool>,
}

impl<C: CatchUp> Worker<C> {
    fn set_state(&self, next: ClientState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(from = ?*current, to = ?next, "client state change");
                *current = next;
                true
            }
        });
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow() || self.events.is_closed()
    }

    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            if self.stopped() {
                break;
            }

            self.set_state(ClientState::Connecting);
            let connect = connect_async(self.config.ws_url.as_str());
            let result = tokio::select! {
                r = connect => r,
                _ = self.stop.changed() => break,
            };

            match result {
                Ok((socket, _)) => {
                    failures = 0;
                    let end = self.session(socket).await;
                    self.set_state(ClientState::Disconnected);
                    if let SessionEnd::Shutdown = end {
                        break;
                    }
                    tracing::info!("live channel disconnected");
                }
                Err(e) => {
                    self.set_state(ClientState::Disconnected);
                    tracing::warn!(url = %self.config.ws_url, "failed to connect: {}", e);
                    failures = failures.saturating_add(1);
                }
            }

            let delay = self.config.reconnect.delay_for(failures);
            tracing::debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.changed() => break,
            }
        }

        self.set_state(ClientState::Disconnected);
        tracing::debug!("client loop exited");
    }

    async fn session(&mut self, socket: LiveSocket) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();

        // Catch-up starts only once the server has registered this
        // connection, so every record is on at least one of the two paths.
        let observer_id = match self.await_ready(&mut stream).await {
            Ok(id) => id,
            Err(end) => {
                close(&mut sink).await;
                return end;
            }
        };
        self.set_state(ClientState::Connected);
        tracing::info!(
            url = %self.config.ws_url,
            observer_id = %observer_id,
            "connected to live channel"
        );

        // Live frames buffer in the socket while history is replayed.
        if !self.replay_history().await {
            close(&mut sink).await;
            return SessionEnd::Shutdown;
        }

        loop {
            let next = tokio::select! {
                msg = stream.next() => msg,
                _ = self.stop.changed() => {
                    close(&mut sink).await;
                    return SessionEnd::Shutdown;
                }
            };

            match next {
                Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                    Ok(envelope) => {
                        if !self.deliver(ClientEvent::Live(envelope)).await {
                            close(&mut sink).await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("dropping malformed frame: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("live channel error: {}", ClientError::from(e));
                    return SessionEnd::Dropped;
                }
            }
        }
    }

    /// Waits for the server's ready frame and returns the observer id it
    /// carries.
    async fn await_ready(
        &mut self,
        stream: &mut SplitStream<LiveSocket>,
    ) -> Result<String, SessionEnd> {
        let deadline = tokio::time::sleep(self.config.ready_timeout);
        tokio::pin!(deadline);

        loop {
            let next = tokio::select! {
                msg = stream.next() => msg,
                _ = &mut deadline => {
                    tracing::warn!(
                        timeout_ms = self.config.ready_timeout.as_millis() as u64,
                        "live channel never became ready"
                    );
                    return Err(SessionEnd::Dropped);
                }
                _ = self.stop.changed() => return Err(SessionEnd::Shutdown),
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    return match ReadyFrame::parse(text.as_str()) {
                        Some(ready) => Ok(ready.data.observer_id),
                        None => {
                            tracing::warn!("live channel sent data before its ready frame");
                            Err(SessionEnd::Dropped)
                        }
                    };
                }
                Some(Ok(Message::Close(_))) | None => return Err(SessionEnd::Dropped),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("live channel error: {}", ClientError::from(e));
                    return Err(SessionEnd::Dropped);
                }
            }
        }
    }

    /// Replays recent history for every subject. Returns `false` if the
    /// consumer went away or stop was requested.
    async fn replay_history(&mut self) -> bool {
        let limit = self.config.catch_up_limit;
        for subject_id in self.config.subjects.clone() {
            let fetched = tokio::select! {
                r = self.catch_up.recent(subject_id, limit) => r,
                _ = self.stop.changed() => return false,
            };
            match fetched {
                Ok(mut envelopes) => {
                    envelopes.reverse();
                    tracing::debug!(subject_id, count = envelopes.len(), "replaying history");
                    for envelope in envelopes {
                        if !self.deliver(ClientEvent::CatchUp(envelope)).await {
                            return false;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(subject_id, "catch-up failed: {}", e);
                }
            }
        }
        true
    }

    /// Forwards an event unless its record was already delivered. Returns
    /// `false` if the consumer dropped the receiver or stop was requested
    /// while the event channel was full.
    async fn deliver(&mut self, event: ClientEvent) -> bool {
        if !self.seen.insert(event.envelope().data.id()) {
            tracing::trace!(record_id = event.envelope().data.id(), "suppressed duplicate");
            return true;
        }
        tokio::select! {
            sent = self.events.send(event) => sent.is_ok(),
            _ = self.stop.changed() => false,
        }
    }
}

/// Sends a close frame without waiting on a peer that stopped reading.
async fn close(sink: &mut SplitSink<LiveSocket, Message>) {
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
}
