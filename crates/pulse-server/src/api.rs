//! HTTP handlers for catch-up queries and external ingest.

use crate::AppState;
use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use pulse_store::StoreError;
use pulse_types::{Envelope, MetricKind, NewMetric};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// Catch-up page size when the caller does not pass `limit`.
pub const DEFAULT_RECENT_LIMIT: usize = 24;

/// Upper bound on a single catch-up page.
pub const MAX_RECENT_LIMIT: usize = 1000;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::Validation(v) => ApiError::BadRequest(v.to_string()),
            StoreError::Pool(_) | StoreError::Unavailable(_) => {
                tracing::warn!("metric store unavailable: {}", e);
                ApiError::ServiceUnavailable("metric store unavailable".to_string())
            }
            _ => {
                tracing::error!("metric store error: {}", e);
                ApiError::InternalServerError("metric store error".to_string())
            }
        }
    }
}

/// Query parameters for `GET /api/metrics/{subjectId}/recent`.
#[derive(Debug, Default, Deserialize)]
pub struct RecentQuery {
    /// Maximum number of records (default 24, clamped to 1..=1000).
    pub limit: Option<i64>,
    /// Restrict to one kind (`STATS` or `stats`).
    pub kind: Option<String>,
}

/// Query parameters for `GET /api/metrics/{subjectId}/latest`.
#[derive(Debug, Default, Deserialize)]
pub struct LatestQuery {
    pub kind: Option<String>,
}

fn parse_kind(kind: Option<&str>) -> Result<Option<MetricKind>, ApiError> {
    match kind {
        None | Some("") => Ok(None),
        Some(k) => k.parse().map(Some).map_err(|_| {
            ApiError::BadRequest(format!(
                "invalid kind: {}. Expected one of: STATS, HARDWARE, SHARE, TRANSFER",
                k
            ))
        }),
    }
}

fn check_subject(subject_id: i64) -> Result<(), ApiError> {
    if subject_id <= 0 {
        return Err(ApiError::BadRequest(format!(
            "subject id must be positive, got {}",
            subject_id
        )));
    }
    Ok(())
}

/// Resolves the effective page size for a catch-up query.
pub fn effective_limit(requested: Option<i64>) -> usize {
    match requested {
        None => DEFAULT_RECENT_LIMIT,
        Some(n) => n.clamp(1, MAX_RECENT_LIMIT as i64) as usize,
    }
}

/// Handler for `GET /api/metrics/{subjectId}/recent`.
///
/// Returns envelopes newest first, the same shape the live channel pushes.
pub async fn recent_metrics_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject_id): Path<i64>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    check_subject(subject_id)?;
    let kind = parse_kind(params.kind.as_deref())?;
    let limit = effective_limit(params.limit);

    let store = Arc::clone(&state.store);
    let records = tokio::task::spawn_blocking(move || store.recent(subject_id, kind, limit))
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))??;

    Ok(Json(records.into_iter().map(Envelope::from).collect()))
}

/// Handler for `GET /api/metrics/{subjectId}/latest`.
pub async fn latest_metric_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subject_id): Path<i64>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<Envelope>, ApiError> {
    check_subject(subject_id)?;
    let kind = parse_kind(params.kind.as_deref())?;

    let store = Arc::clone(&state.store);
    let record = tokio::task::spawn_blocking(move || store.latest(subject_id, kind))
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))??;

    record
        .map(|r| Json(r.to_envelope()))
        .ok_or_else(|| ApiError::NotFound(format!("no metrics for subject {}", subject_id)))
}

/// Handler for `POST /api/metrics`.
///
/// Validates and persists the draft, publishes it to live observers, and
/// returns the persisted envelope.
pub async fn ingest_metric_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Result<Json<NewMetric>, JsonRejection>,
) -> Result<(StatusCode, Json<Envelope>), ApiError> {
    let Json(draft) = body.map_err(|e| match e.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::PayloadTooLarge(e.body_text()),
        _ => ApiError::BadRequest(e.body_text()),
    })?;

    let store = Arc::clone(&state.store);
    let record = tokio::task::spawn_blocking(move || store.append(&draft))
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))??;

    let report = state.bus.publish(&record);
    tracing::debug!(
        record_id = record.id(),
        subject_id = record.subject_id(),
        kind = record.kind().as_str(),
        delivered = report.delivered,
        "ingested metric"
    );

    Ok((StatusCode::CREATED, Json(record.to_envelope())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(effective_limit(None), 24);
        assert_eq!(effective_limit(Some(0)), 1);
        assert_eq!(effective_limit(Some(-5)), 1);
        assert_eq!(effective_limit(Some(50)), 50);
        assert_eq!(effective_limit(Some(5_000)), 1000);
    }

    #[test]
    fn kind_query_accepts_both_labels() {
        assert_eq!(parse_kind(Some("STATS")).unwrap(), Some(MetricKind::Stats));
        assert_eq!(parse_kind(Some("hardware")).unwrap(), Some(MetricKind::Hardware));
        assert_eq!(parse_kind(None).unwrap(), None);
        assert!(matches!(parse_kind(Some("mining")), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn validation_failures_map_to_bad_request() {
        let err: ApiError = StoreError::Validation(pulse_types::ValidationError::InvalidSubject(0)).into();
        assert!(matches!(err, ApiError::BadRequest(_)));

        let err: ApiError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, ApiError::ServiceUnavailable(_)));
    }
}
