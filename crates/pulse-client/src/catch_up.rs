//! Historical catch-up transport.

use pulse_types::Envelope;
use std::future::Future;
use std::time::Duration;

use crate::error::ClientError;

/// Fetches the most recent records for a subject, newest first.
pub trait CatchUp: Send + Sync + 'static {
    fn recent(
        &self,
        subject_id: i64,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Envelope>, ClientError>> + Send;
}

/// [`CatchUp`] over the server's `GET /api/metrics/{subjectId}/recent`.
#[derive(Debug, Clone)]
pub struct HttpCatchUp {
    client: reqwest::Client,
    base_url: String,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

impl HttpCatchUp {
    /// `base_url` is the server root, e.g. `http://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("pulse-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl CatchUp for HttpCatchUp {
    async fn recent(&self, subject_id: i64, limit: usize) -> Result<Vec<Envelope>, ClientError> {
        let url = format!("{}/api/metrics/{}/recent", self.base_url, subject_id);
        let resp = self
            .client
            .get(&url)
            .query(&[("limit", limit)])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClientError::Status(resp.status().as_u16()));
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}
