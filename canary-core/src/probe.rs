use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("metrics probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed metrics payload: {0}")]
    Malformed(String),
}

/// One observation of the canary's health. Immutable once captured; the
/// monitoring loop appends each sample to the session-scoped sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub captured_at: DateTime<Utc>,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub error_rate: f64,
    pub throughput_rps: f64,
}

/// Wire schema of the metrics source. Every field is required: a missing
/// field is a `ProbeError::Malformed`, never a silently-assumed zero.
#[derive(Debug, Deserialize)]
struct MetricsPayload {
    p50: f64,
    p95: f64,
    p99: f64,
    error_rate: f64,
    throughput: f64,
}

impl From<MetricsPayload> for MetricSample {
    fn from(payload: MetricsPayload) -> Self {
        Self {
            captured_at: Utc::now(),
            latency_p50_ms: payload.p50,
            latency_p95_ms: payload.p95,
            latency_p99_ms: payload.p99,
            error_rate: payload.error_rate,
            throughput_rps: payload.throughput,
        }
    }
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self) -> ProbeResult<MetricSample>;
}

pub struct HttpMetricsProbe {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpMetricsProbe {
    pub fn new(client: Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn with_default_client(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self::new(Client::new(), endpoint, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsProbe {
    async fn fetch(&self) -> ProbeResult<MetricSample> {
        let request = async {
            let response = self
                .client
                .get(&self.endpoint)
                .send()
                .await?
                .error_for_status()?;
            response.text().await
        };
        let body = timeout(self.timeout, request)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))??;
        let payload: MetricsPayload = serde_json::from_str(&body)
            .map_err(|err| ProbeError::Malformed(err.to_string()))?;
        Ok(payload.into())
    }
}
