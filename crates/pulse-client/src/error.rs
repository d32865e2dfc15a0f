//! Error types for the reconnecting client.

use thiserror::Error;

/// Errors surfaced by the client's transports.
///
/// None of these end the reconnect loop; they are logged and turned into a
/// state transition.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The live channel could not be opened or broke mid-stream.
    #[error("websocket error: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// The catch-up request failed in transport.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The catch-up endpoint answered with a non-success status.
    #[error("catch-up request returned status {0}")]
    Status(u16),

    /// A frame or response body was not a valid envelope.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// An envelope's `type` disagrees with its record's kind.
    #[error("envelope type `{label}` does not match record kind {kind}")]
    KindMismatch { label: String, kind: String },
}
