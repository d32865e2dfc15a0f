//! The metric store contract and its SQLite implementation.
//!
//! All writes go through [`MetricStore::append`], which validates the draft,
//! assigns an id and a per-subject strictly increasing timestamp, and
//! inserts into `metric_records` inside a single immediate transaction.
//!
//! Reads are newest-first. Timestamps never collide within a subject, so
//! [`MetricStore::recent`] is strictly descending by `emittedAt` with no
//! duplicates.

use chrono::{DateTime, Utc};
use pulse_db::DbPool;
use pulse_types::{validate_payload, MetricKind, MetricRecord, NewMetric, Payload};
use rusqlite::{params, TransactionBehavior};

use crate::error::StoreError;

/// Append-only keeper of metric snapshots, keyed by subject and time.
///
/// Implementations are synchronous; async callers should run them on a
/// blocking thread.
pub trait MetricStore: Send + Sync + 'static {
    /// Validates and persists a draft, returning the stored record.
    ///
    /// # Errors
    ///
    /// `StoreError::Validation` for schema failures, any other variant when
    /// the store itself failed.
    fn append(&self, draft: &NewMetric) -> Result<MetricRecord, StoreError>;

    /// Returns up to `limit` records for a subject, newest first.
    ///
    /// `kind = None` covers every kind.
    fn recent(
        &self,
        subject_id: i64,
        kind: Option<MetricKind>,
        limit: usize,
    ) -> Result<Vec<MetricRecord>, StoreError>;

    /// Returns the newest record for a subject, if any.
    fn latest(
        &self,
        subject_id: i64,
        kind: Option<MetricKind>,
    ) -> Result<Option<MetricRecord>, StoreError> {
        Ok(self.recent(subject_id, kind, 1)?.into_iter().next())
    }
}

/// [`MetricStore`] backed by the pooled SQLite database.
#[derive(Clone)]
pub struct SqliteMetricStore {
    pool: DbPool,
}

impl SqliteMetricStore {
    /// Wraps a pool whose migrations have already been applied.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl std::fmt::Debug for SqliteMetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetricStore")
            .field("max_connections", &self.pool.max_size())
            .finish()
    }
}

impl MetricStore for SqliteMetricStore {
    fn append(&self, draft: &NewMetric) -> Result<MetricRecord, StoreError> {
        let payload = validate_payload(draft)?;
        let payload_json = serde_json::to_string(&payload)?;

        let mut conn = self.pool.get()?;
        // IMMEDIATE takes the write lock up front so the MAX() read and the
        // insert see the same state across pooled connections.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last_us: Option<i64> = tx.query_row(
            "SELECT MAX(emitted_at_us) FROM metric_records WHERE subject_id = ?1",
            params![draft.subject_id],
            |row| row.get(0),
        )?;
        let now_us = Utc::now().timestamp_micros();
        let emitted_at_us = match last_us {
            Some(last) if last >= now_us => last + 1,
            _ => now_us,
        };

        let id: i64 = tx.query_row(
            "INSERT INTO metric_records (subject_id, kind, payload_json, emitted_at_us)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING id",
            params![
                draft.subject_id,
                draft.kind.as_str(),
                payload_json,
                emitted_at_us
            ],
            |row| row.get(0),
        )?;
        tx.commit()?;

        tracing::trace!(
            id,
            subject_id = draft.subject_id,
            kind = draft.kind.as_str(),
            "appended metric record"
        );

        Ok(MetricRecord::from_parts(
            id,
            draft.kind,
            draft.subject_id,
            decode_timestamp(id, emitted_at_us)?,
            payload,
        ))
    }

    fn recent(
        &self,
        subject_id: i64,
        kind: Option<MetricKind>,
        limit: usize,
    ) -> Result<Vec<MetricRecord>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut clauses = vec!["subject_id = ?1".to_string()];
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(subject_id)];
        let mut idx = 2u32;

        if let Some(kind) = kind {
            clauses.push(format!("kind = ?{idx}"));
            param_values.push(Box::new(kind.as_str()));
            idx += 1;
        }

        let where_clause = clauses.join(" AND ");
        let sql = format!(
            "SELECT id, subject_id, kind, payload_json, emitted_at_us
             FROM metric_records
             WHERE {where_clause}
             ORDER BY emitted_at_us DESC, id DESC
             LIMIT ?{idx}"
        );
        param_values.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));

        let params_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| &**p).collect();

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_refs.as_slice(), |row| {
            Ok(RawRow {
                id: row.get(0)?,
                subject_id: row.get(1)?,
                kind: row.get(2)?,
                payload_json: row.get(3)?,
                emitted_at_us: row.get(4)?,
            })
        })?;

        let mut records = Vec::with_capacity(limit.min(256));
        for row in rows {
            records.push(row?.decode()?);
        }
        Ok(records)
    }
}

/// A `metric_records` row before decoding.
struct RawRow {
    id: i64,
    subject_id: i64,
    kind: String,
    payload_json: String,
    emitted_at_us: i64,
}

impl RawRow {
    fn decode(self) -> Result<MetricRecord, StoreError> {
        let kind: MetricKind = self.kind.parse().map_err(|e| StoreError::Corrupt {
            id: self.id,
            reason: format!("{e}"),
        })?;
        let payload: Payload = serde_json::from_str(&self.payload_json)?;
        Ok(MetricRecord::from_parts(
            self.id,
            kind,
            self.subject_id,
            decode_timestamp(self.id, self.emitted_at_us)?,
            payload,
        ))
    }
}

fn decode_timestamp(id: i64, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        id,
        reason: format!("timestamp out of range: {micros}"),
    })
}
