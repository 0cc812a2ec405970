//! RFC 8628 device authorization grant.

use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use serde::Deserialize;
use tokio::time::Instant;

use super::CredentialSource;
use crate::config::{AgentConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::error::SourceError;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// What to do after a token poll returned an error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    Continue,
    Fail(String),
    Expired,
}

/// Polling cadence and deadline of one device-code login.
#[derive(Debug, Clone)]
pub struct PollState {
    pub interval: Duration,
    pub deadline: Instant,
}

impl PollState {
    /// The deadline is the smaller of the code lifetime and `max_wait`.
    pub fn new(interval: Duration, expires_in: Duration, max_wait: Duration) -> Self {
        Self {
            interval,
            deadline: Instant::now() + expires_in.min(max_wait),
        }
    }

    /// True once the login deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Applies an RFC 8628 token endpoint error code.
    pub fn on_error(&mut self, code: &str) -> PollDecision {
        match code {
            "authorization_pending" => PollDecision::Continue,
            "slow_down" => {
                self.interval += SLOW_DOWN_STEP;
                PollDecision::Continue
            }
            "expired_token" => PollDecision::Expired,
            // access_denied, authorization_declined and anything unknown
            other => PollDecision::Fail(other.to_string()),
        }
    }
}

/// Interactive login: the user enters a code at the provider's page while
/// the agent polls the token endpoint.
pub struct DeviceCodeSource {
    http: reqwest::Client,
    device_endpoint: String,
    token_endpoint: String,
    client_id: String,
    scopes: String,
    max_wait: Duration,
    request_timeout: Duration,
}

impl DeviceCodeSource {
    pub fn new(
        device_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        scopes: impl Into<String>,
        max_wait: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            device_endpoint: device_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            scopes: scopes.into(),
            max_wait,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Limit on each call to the provider. Polls are further bounded by the
    /// login deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns `None` unless a client id and endpoints (explicit or derived
    /// from the authority) are configured.
    pub fn from_config(config: &AgentConfig) -> Option<Self> {
        let client_id = config.client_id.as_deref()?;
        let authority = config
            .authority
            .as_deref()
            .map(|a| a.trim_end_matches('/').to_string());
        let endpoint = |explicit: &Option<String>, suffix: &str| {
            explicit
                .clone()
                .or_else(|| authority.as_ref().map(|a| format!("{a}{suffix}")))
        };

        let device_endpoint = endpoint(
            &config.device_code.device_authorization_endpoint,
            "/oauth2/v2.0/devicecode",
        )?;
        let token_endpoint = endpoint(&config.device_code.token_endpoint, "/oauth2/v2.0/token")?;

        Some(
            Self::new(
                device_endpoint,
                token_endpoint,
                client_id,
                config.scopes.as_str(),
                config.device_code.max_wait,
            )
            .with_request_timeout(config.request_timeout),
        )
    }

    async fn authorize(&self) -> Result<DeviceAuthorization, SourceError> {
        let resp = self
            .http
            .post(&self.device_endpoint)
            .timeout(self.request_timeout)
            .form(&[("client_id", self.client_id.as_str()), ("scope", self.scopes.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Protocol(format!(
                "device authorization failed (HTTP {status}): {body}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| SourceError::Protocol(format!("device authorization response: {e}")))
    }

    fn print_instructions(authorization: &DeviceAuthorization) {
        match &authorization.message {
            Some(message) => eprintln!("{message}"),
            None => eprintln!(
                "To sign in, open {} and enter the code {}",
                authorization.verification_uri.cyan(),
                authorization.user_code.bold()
            ),
        }
    }
}

#[async_trait]
impl CredentialSource for DeviceCodeSource {
    fn name(&self) -> &str {
        "device-code"
    }

    async fn try_acquire(&self) -> Result<Option<String>, SourceError> {
        let authorization = self.authorize().await?;
        Self::print_instructions(&authorization);

        let mut poll = PollState::new(
            Duration::from_secs(authorization.interval.unwrap_or(DEFAULT_INTERVAL_SECS)),
            Duration::from_secs(authorization.expires_in),
            self.max_wait,
        );
        tracing::info!(
            interval_secs = poll.interval.as_secs(),
            "waiting for device code confirmation"
        );

        loop {
            tokio::time::sleep(poll.interval).await;
            if poll.expired() {
                return Err(SourceError::TimedOut);
            }

            let request = self
                .http
                .post(&self.token_endpoint)
                .timeout(self.request_timeout)
                .form(&[
                    ("grant_type", DEVICE_CODE_GRANT),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", authorization.device_code.as_str()),
                ])
                .send();
            let resp = tokio::time::timeout_at(poll.deadline, request)
                .await
                .map_err(|_| SourceError::TimedOut)??;

            if resp.status().is_success() {
                let token: TokenResponse = tokio::time::timeout_at(poll.deadline, resp.json())
                    .await
                    .map_err(|_| SourceError::TimedOut)?
                    .map_err(|e| SourceError::Protocol(format!("token response: {e}")))?;
                return token
                    .id_token
                    .or(token.access_token)
                    .map(Some)
                    .ok_or_else(|| SourceError::Protocol("token response carries no token".into()));
            }

            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let error: TokenErrorResponse = serde_json::from_str(&body).map_err(|_| {
                SourceError::Protocol(format!("token endpoint returned HTTP {status}: {body}"))
            })?;

            match poll.on_error(&error.error) {
                PollDecision::Continue => {
                    tracing::debug!(error = %error.error, "device code not yet confirmed");
                }
                PollDecision::Expired => return Err(SourceError::TimedOut),
                PollDecision::Fail(code) => {
                    return Err(SourceError::Denied(
                        error.error_description.unwrap_or(code),
                    ));
                }
            }
        }
    }
}
