use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{DEFAULT_REQUEST_TIMEOUT, RetryConfig};
use crate::error::BrokerError;

/// Credential pair returned by both broker endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialPair {
    /// Short-lived bearer credential for downstream APIs.
    pub access_credential: String,
    /// Single-use credential for `/auth/refresh`.
    pub refresh_credential: String,
    /// Unix seconds.
    pub access_expiry: i64,
    /// Unix seconds.
    pub refresh_expiry: i64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    replay_suspected: bool,
}

/// The broker operations the agent depends on.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// `POST /auth/verify`
    async fn exchange(
        &self,
        identity_assertion: &str,
        device_id: Option<&str>,
    ) -> Result<CredentialPair, BrokerError>;

    /// `POST /auth/refresh`
    async fn redeem(&self, refresh_credential: &str) -> Result<CredentialPair, BrokerError>;
}

/// HTTP broker client with bounded retries for transient failures.
///
/// Every attempt is cut off after the request timeout and counts as a
/// transient failure.
pub struct HttpBroker {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    timeout: Duration,
}

impl HttpBroker {
    /// Client for the broker at `base_url` using the default request timeout.
    pub fn new(base_url: &str, retry: RetryConfig) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, retry)
    }

    /// Same as [`HttpBroker::new`] over a caller-supplied `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: &str, retry: RetryConfig) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Limit on each attempt, from connect until the body is read.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<CredentialPair, BrokerError> {
        let url = format!("{}{path}", self.base_url);
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.post_once(&url, body).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "broker call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<CredentialPair, BrokerError> {
        let resp = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| BrokerError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<CredentialPair>()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        BrokerError::Transient(e.to_string())
                    } else {
                        BrokerError::Protocol(format!("invalid credential pair: {e}"))
                    }
                });
        }

        let text = resp.text().await.unwrap_or_default();
        let error: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = error
            .error_description
            .or(error.error)
            .unwrap_or_else(|| format!("HTTP {status}"));

        Err(match status {
            StatusCode::UNAUTHORIZED => BrokerError::Rejected {
                replay_suspected: error.replay_suspected,
                message,
            },
            s if s.is_server_error() => BrokerError::Transient(format!("HTTP {s}: {message}")),
            s => BrokerError::Protocol(format!("HTTP {s}: {message}")),
        })
    }
}

#[async_trait]
impl BrokerApi for HttpBroker {
    async fn exchange(
        &self,
        identity_assertion: &str,
        device_id: Option<&str>,
    ) -> Result<CredentialPair, BrokerError> {
        let body = match device_id {
            Some(device_id) => {
                json!({ "identity_assertion": identity_assertion, "device_id": device_id })
            }
            None => json!({ "identity_assertion": identity_assertion }),
        };
        self.post("/auth/verify", &body).await
    }

    async fn redeem(&self, refresh_credential: &str) -> Result<CredentialPair, BrokerError> {
        self.post(
            "/auth/refresh",
            &json!({ "refresh_credential": refresh_credential }),
        )
        .await
    }
}
