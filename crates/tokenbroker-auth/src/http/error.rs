//! Error responses for the broker endpoints.
//!
//! This module implements `IntoResponse` for `AuthError`, producing
//! OAuth-style JSON bodies.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::error::AuthError;

/// Seconds a client should wait before retrying after a 503.
const RETRY_AFTER_SECS: &str = "30";

// =============================================================================
// IntoResponse Implementation
// =============================================================================

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let oauth_error = self.oauth_error_code();
        let message = description(&self);

        if status.is_server_error() {
            tracing::error!(category = %self.category(), "Request failed: {}", self);
        }

        let mut body = json!({
            "error": oauth_error,
            "error_description": message,
        });
        if let AuthError::RefreshRejected { reason } = &self {
            body["rejection"] = json!(reason.as_str());
            if reason.is_replay_suspect() {
                body["replay_suspected"] = json!(true);
            }
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

        if status == StatusCode::UNAUTHORIZED {
            let www_auth = build_www_authenticate_header(oauth_error, &message);
            if let Ok(value) = HeaderValue::from_str(&www_auth) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECS),
            );
        }

        (status, headers, Json(body)).into_response()
    }
}

fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::Discovery(_) | AuthError::Storage { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::InvalidAssertion { .. }
        | AuthError::RefreshRejected { .. }
        | AuthError::InvalidToken { .. } => StatusCode::UNAUTHORIZED,
        AuthError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        AuthError::Configuration { .. } | AuthError::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Client-facing description. Server-side failures are not detailed.
fn description(error: &AuthError) -> String {
    match error {
        AuthError::Discovery(_) => "identity provider keys are temporarily unavailable".to_string(),
        AuthError::Storage { .. } => "credential store is temporarily unavailable".to_string(),
        AuthError::Configuration { .. } | AuthError::Internal { .. } => {
            "internal server error".to_string()
        }
        AuthError::InvalidAssertion { message }
        | AuthError::InvalidToken { message }
        | AuthError::InvalidRequest { message } => message.clone(),
        AuthError::RefreshRejected { reason } => reason.to_string(),
    }
}

/// Builds the WWW-Authenticate header value for 401 responses.
///
/// Format: `Bearer realm="tokenbroker", error="invalid_grant", error_description="..."`
fn build_www_authenticate_header(error: &str, description: &str) -> String {
    let escaped_desc = description.replace('\"', "\\\"");
    format!(
        "Bearer realm=\"tokenbroker\", error=\"{}\", error_description=\"{}\"",
        error, escaped_desc
    )
}

// =============================================================================
// Tests
// =============================================================================
