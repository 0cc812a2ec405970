//! Broker error types.
//!
//! This module defines the errors surfaced by assertion validation, credential
//! minting and refresh redemption.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::federation::DiscoveryError;

/// Why a refresh credential was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshRejection {
    /// The credential id was never issued by this ledger.
    Unknown,
    /// The credential is past its expiry.
    Expired,
    /// The credential was already redeemed once. Possible theft.
    AlreadyConsumed,
    /// The subject's credential family was revoked after a replay.
    Revoked,
    /// Not a refresh credential, or the signature does not verify.
    Malformed,
}

impl RefreshRejection {
    /// Returns `true` when the rejection indicates a replayed credential.
    #[must_use]
    pub fn is_replay_suspect(self) -> bool {
        matches!(self, Self::AlreadyConsumed)
    }

    /// Stable identifier used in logs and response bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Expired => "expired",
            Self::AlreadyConsumed => "already_consumed",
            Self::Revoked => "revoked",
            Self::Malformed => "malformed",
        }
    }
}

impl fmt::Display for RefreshRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "refresh credential is unknown",
            Self::Expired => "refresh credential has expired",
            Self::AlreadyConsumed => "refresh credential was already used",
            Self::Revoked => "refresh credential family was revoked",
            Self::Malformed => "refresh credential is malformed",
        };
        f.write_str(text)
    }
}

/// Errors that can occur while brokering credentials.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The identity provider's key set could not be obtained.
    #[error("Key set unavailable: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The identity assertion failed signature, issuer, audience or timing checks.
    #[error("Invalid identity assertion: {message}")]
    InvalidAssertion {
        /// Description of why the assertion is invalid.
        message: String,
    },

    /// The refresh credential was refused.
    #[error("Refresh rejected: {reason}")]
    RefreshRejected {
        /// The specific rejection.
        reason: RefreshRejection,
    },

    /// An internal access credential is invalid or expired.
    #[error("Invalid token: {message}")]
    InvalidToken {
        /// Description of why the token is invalid.
        message: String,
    },

    /// The request is malformed.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// An error occurred while reading or writing the rotation ledger.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// The broker configuration is invalid.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error.
        message: String,
    },

    /// An unexpected internal error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl AuthError {
    /// Creates a new `InvalidAssertion` error.
    #[must_use]
    pub fn invalid_assertion(message: impl Into<String>) -> Self {
        Self::InvalidAssertion {
            message: message.into(),
        }
    }

    /// Creates a new `RefreshRejected` error.
    #[must_use]
    pub fn refresh_rejected(reason: RefreshRejection) -> Self {
        Self::RefreshRejected { reason }
    }

    /// Creates a new `InvalidToken` error.
    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a new `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidAssertion { .. }
                | Self::RefreshRejected { .. }
                | Self::InvalidToken { .. }
                | Self::InvalidRequest { .. }
        )
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_)
                | Self::Storage { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
        )
    }

    /// Returns `true` if a client may retry the same request later.
    ///
    /// Only infrastructure failures qualify; cryptographic and policy
    /// rejections never succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Discovery(_) | Self::Storage { .. })
    }

    /// Returns `true` if this rejection indicates a replayed refresh credential.
    #[must_use]
    pub fn is_replay_suspect(&self) -> bool {
        matches!(self, Self::RefreshRejected { reason } if reason.is_replay_suspect())
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Discovery(_) => ErrorCategory::Federation,
            Self::InvalidAssertion { .. } => ErrorCategory::Authentication,
            Self::RefreshRejected { .. } => ErrorCategory::Token,
            Self::InvalidToken { .. } => ErrorCategory::Token,
            Self::InvalidRequest { .. } => ErrorCategory::Validation,
            Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "temporarily_unavailable",
            Self::InvalidAssertion { .. } => "invalid_grant",
            Self::RefreshRejected { .. } => "invalid_grant",
            Self::InvalidToken { .. } => "invalid_token",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Storage { .. } => "server_error",
            Self::Configuration { .. } => "server_error",
            Self::Internal { .. } => "server_error",
        }
    }
}

/// Categories of broker errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Identity assertion verification errors.
    Authentication,
    /// Internal credential errors (validation, rotation).
    Token,
    /// Request validation errors.
    Validation,
    /// Infrastructure/storage errors.
    Infrastructure,
    /// Configuration errors.
    Configuration,
    /// Internal server errors.
    Internal,
    /// Identity provider federation errors.
    Federation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Token => write!(f, "token"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
            Self::Federation => write!(f, "federation"),
        }
    }
}
