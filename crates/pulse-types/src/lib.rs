//! Shared types for the Pulse telemetry service.
//!
//! This crate holds the data model every other Pulse crate speaks: the
//! metric kinds, persisted records, producer drafts, and the `{type, data}`
//! envelope pushed over the live channel. Payload validation lives here too
//! so that the store, the ingest endpoint, and tests all agree on what a
//! well-formed record looks like.
//!
//! No crate in the workspace depends on anything *except* `pulse-types` for
//! cross-cutting type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

mod schema;

pub use schema::{validate_payload, FieldType, ValidationError, RESERVED_FIELDS};

/// A metric payload: field name to JSON value.
pub type Payload = Map<String, Value>;

/// The category of a metric event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    /// Aggregate mining statistics (hashrate, share counters, earnings).
    #[serde(alias = "stats")]
    Stats,
    /// Per-device hardware telemetry.
    #[serde(alias = "hardware")]
    Hardware,
    /// A share submission result.
    #[serde(alias = "share")]
    Share,
    /// A transfer record reported by the payment collaborator.
    #[serde(alias = "transfer")]
    Transfer,
}

impl MetricKind {
    /// All kinds, in declaration order.
    pub const ALL: [MetricKind; 4] = [Self::Stats, Self::Hardware, Self::Share, Self::Transfer];

    /// Returns the canonical (stored) label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stats => "STATS",
            Self::Hardware => "HARDWARE",
            Self::Share => "SHARE",
            Self::Transfer => "TRANSFER",
        }
    }

    /// Returns the envelope `type` label for this kind.
    pub fn envelope_type(self) -> &'static str {
        match self {
            Self::Stats => "stats",
            Self::Hardware => "hardware",
            Self::Share => "share",
            Self::Transfer => "transfer",
        }
    }

    /// Parses an envelope `type` label back into a kind.
    pub fn from_envelope_type(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.envelope_type() == s)
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricKind {
    type Err = ParseMetricKindError;

    /// Accepts either the stored label (`STATS`) or the envelope label (`stats`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s || k.envelope_type() == s)
            .ok_or_else(|| ParseMetricKindError(s.to_string()))
    }
}

/// Error returned when parsing an unknown metric kind string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown metric kind: {0}")]
pub struct ParseMetricKindError(pub String);

/// A metric draft handed to the store for persistence.
///
/// Producers build these; the store validates the payload, assigns an id
/// and timestamp, and returns the resulting [`MetricRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMetric {
    pub kind: MetricKind,
    pub subject_id: i64,
    #[serde(default)]
    pub payload: Payload,
}

impl NewMetric {
    pub fn new(kind: MetricKind, subject_id: i64, payload: Payload) -> Self {
        Self {
            kind,
            subject_id,
            payload,
        }
    }
}

/// A persisted metric snapshot.
///
/// Records are immutable once constructed: fields are read through
/// accessors and there is no mutating API. On the wire a record is a flat
/// object where payload fields sit next to `id`, `kind`, `subjectId`, and
/// `emittedAt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    id: i64,
    kind: MetricKind,
    subject_id: i64,
    emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: Payload,
}

impl MetricRecord {
    /// Builds a record from its persisted parts.
    pub fn from_parts(
        id: i64,
        kind: MetricKind,
        subject_id: i64,
        emitted_at: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        Self {
            id,
            kind,
            subject_id,
            emitted_at,
            payload,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn subject_id(&self) -> i64 {
        self.subject_id
    }

    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Convenience lookup of a single payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Wraps this record in its live-channel envelope.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            kind: self.kind.envelope_type().to_string(),
            data: self.clone(),
        }
    }
}

/// The `{type, data}` wrapper around every pushed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Lowercase kind label (`stats`, `hardware`, `share`, `transfer`).
    #[serde(rename = "type")]
    pub kind: String,
    /// The record being delivered.
    pub data: MetricRecord,
}

impl Envelope {
    /// Returns the parsed kind of this envelope, if the label is known.
    pub fn metric_kind(&self) -> Option<MetricKind> {
        MetricKind::from_envelope_type(&self.kind)
    }
}

/// Envelope type of the frame that opens every live connection.
pub const READY_FRAME_TYPE: &str = "hello";

/// Payload of the ready frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    /// Registry id assigned to the connection.
    pub observer_id: String,
}

/// First frame on a live connection, sent once the observer is registered.
///
/// Every record published after this frame is delivered on the same
/// connection, so a consumer that runs catch-up after receiving it cannot
/// miss a record between the two paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Ready,
}

impl ReadyFrame {
    pub fn new(observer_id: impl ToString) -> Self {
        Self {
            kind: READY_FRAME_TYPE.to_string(),
            data: Ready {
                observer_id: observer_id.to_string(),
            },
        }
    }

    /// Parses a text frame, returning `None` unless it is a ready frame.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str::<Self>(text)
            .ok()
            .filter(|frame| frame.kind == READY_FRAME_TYPE)
    }
}

impl From<MetricRecord> for Envelope {
    fn from(record: MetricRecord) -> Self {
        Self {
            kind: record.kind.envelope_type().to_string(),
            data: record,
        }
    }
}
