//! Metric store for the Pulse telemetry service.
//!
//! An append-only record keeper for time-series metric snapshots, keyed by
//! subject id and time. The live broadcast path and the catch-up query path
//! both read from the same records, so what an observer sees live is always
//! what a fresh historical query would return.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pulse_store::{MetricStore, SqliteMetricStore};
//! use pulse_types::{MetricKind, NewMetric};
//!
//! let store = SqliteMetricStore::new(pool);
//! let record = store.append(&NewMetric::new(MetricKind::Stats, 1, payload))?;
//! let history = store.recent(1, None, 24)?;
//! ```

mod error;
mod store;

pub use error::StoreError;
pub use store::{MetricStore, SqliteMetricStore};
