//! Reconnecting client for the Pulse live channel.
//!
//! Keeps a WebSocket to the server open across drops, backfills whatever
//! was published while it was away through the catch-up API, and hands the
//! consumer one ordered stream of envelopes with duplicates removed.
//!
//! ```rust,ignore
//! use pulse_client::{ClientConfig, HttpCatchUp, ReconnectingClient};
//!
//! let config = ClientConfig::new("ws://127.0.0.1:3000/ws", vec![1]);
//! let (handle, mut events) =
//!     ReconnectingClient::spawn(config, HttpCatchUp::new("http://127.0.0.1:3000"));
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event.envelope());
//! }
//! handle.stop().await;
//! ```

mod catch_up;
mod client;
mod dedup;
mod error;

pub use catch_up::{CatchUp, HttpCatchUp};
pub use client::{
    decode_frame, ClientConfig, ClientEvent, ClientHandle, ClientState, ReconnectPolicy,
    ReconnectingClient,
};
pub use dedup::SeenWindow;
pub use error::ClientError;
