//! Credential exchange and refresh endpoints.
//!
//! - `POST /auth/verify` exchanges an identity assertion for a credential pair
//! - `POST /auth/refresh` redeems a refresh credential for a rotated pair
//! - `GET /health` reports liveness

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::AuthError;
use crate::token::{CredentialService, IssuedCredentials};

/// State for the broker endpoints.
#[derive(Clone)]
pub struct BrokerState {
    /// Credential service backing both endpoints.
    pub service: Arc<CredentialService>,
}

impl BrokerState {
    /// Creates a new broker state.
    pub fn new(service: Arc<CredentialService>) -> Self {
        Self { service }
    }
}

/// Body of `POST /auth/verify`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifyRequest {
    /// Raw identity assertion from the external provider.
    #[serde(alias = "id_token")]
    pub identity_assertion: String,

    /// Identifier of the requesting device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Body of `POST /auth/refresh`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshRequest {
    /// Refresh credential from a previous exchange or refresh.
    #[serde(alias = "refresh_token")]
    pub refresh_credential: String,
}

/// Successful response of both endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CredentialPairResponse {
    /// Access credential.
    pub access_credential: String,
    /// Refresh credential.
    pub refresh_credential: String,
    /// Access credential expiry (Unix seconds).
    pub access_expiry: i64,
    /// Refresh credential expiry (Unix seconds).
    pub refresh_expiry: i64,
    /// Always `Bearer`.
    pub token_type: String,
    /// Seconds until the access credential expires.
    pub expires_in: i64,
}

impl From<IssuedCredentials> for CredentialPairResponse {
    fn from(issued: IssuedCredentials) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            expires_in: (issued.access.expires_at - now).whole_seconds().max(0),
            access_expiry: issued.access.expires_at.unix_timestamp(),
            refresh_expiry: issued.refresh.expires_at.unix_timestamp(),
            access_credential: issued.access.token,
            refresh_credential: issued.refresh.token,
            token_type: "Bearer".to_string(),
        }
    }
}

/// Builds the router for the broker endpoints.
pub fn broker_routes(state: BrokerState) -> Router {
    Router::new()
        .route("/auth/verify", post(verify_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Handler for `POST /auth/verify`.
///
/// # Responses
///
/// - `200` with a [`CredentialPairResponse`]
/// - `400` for a malformed body
/// - `401` for an invalid or expired assertion
/// - `503` when the identity provider's keys are unavailable
pub async fn verify_handler(
    State(state): State<BrokerState>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return invalid_body(rejection),
    };

    debug!(device_id = ?request.device_id, "Processing identity assertion exchange");

    match state
        .service
        .exchange(&request.identity_assertion, request.device_id.as_deref())
        .await
    {
        Ok(issued) => credential_response(issued),
        Err(e) => {
            if e.is_client_error() {
                tracing::warn!(error = %e, "Identity assertion rejected");
            }
            e.into_response()
        }
    }
}

/// Handler for `POST /auth/refresh`.
///
/// # Responses
///
/// - `200` with a rotated [`CredentialPairResponse`]
/// - `400` for a malformed body
/// - `401` when the credential is rejected; `replay_suspected` is set for a
///   credential that was already consumed
pub async fn refresh_handler(
    State(state): State<BrokerState>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return invalid_body(rejection),
    };

    match state.service.redeem(&request.refresh_credential).await {
        Ok(issued) => credential_response(issued),
        Err(e) => e.into_response(),
    }
}

/// Handler for `GET /health`.
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn credential_response(issued: IssuedCredentials) -> Response {
    let mut response = Json(CredentialPairResponse::from(issued)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn invalid_body(rejection: JsonRejection) -> Response {
    debug!("Rejected request body: {}", rejection.body_text());
    AuthError::invalid_request(rejection.body_text()).into_response()
}
