//! Error types for the session agent.

use thiserror::Error;

/// Failures talking to the broker's `/auth/verify` and `/auth/refresh`.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker answered 401. Never retried.
    #[error("broker rejected the credential: {message}")]
    Rejected {
        /// Set when the broker flagged a reused refresh credential.
        replay_suspected: bool,
        message: String,
    },

    /// Connect errors, timeouts and 5xx responses that outlived the retry budget.
    #[error("broker unavailable: {0}")]
    Transient(String),

    /// Any other unexpected response.
    #[error("unexpected broker response: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Returns true if the call may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failures of a single credential source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The user or provider refused the login.
    #[error("login denied: {0}")]
    Denied(String),

    /// The interactive flow ran out of time.
    #[error("login timed out")]
    TimedOut,

    #[error("identity provider request failed: {0}")]
    Network(String),

    #[error("identity provider response invalid: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Top-level agent error.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No credential source produced an assertion the broker accepted.
    #[error("could not acquire a session: {message}")]
    AcquisitionFailed { message: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Session file could not be written or removed.
    #[error("session store error: {0}")]
    Session(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AgentError {
    pub fn acquisition_failed(message: impl Into<String>) -> Self {
        Self::AcquisitionFailed {
            message: message.into(),
        }
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::Session(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(BrokerError::Transient("503".into()).is_transient());
        assert!(
            !BrokerError::Rejected {
                replay_suspected: false,
                message: "expired".into()
            }
            .is_transient()
        );
        assert!(!BrokerError::Protocol("bad json".into()).is_transient());
    }

    #[test]
    fn test_broker_error_converts_transparently() {
        let err: AgentError = BrokerError::Transient("connection refused".into()).into();
        assert_eq!(err.to_string(), "broker unavailable: connection refused");
    }
}
