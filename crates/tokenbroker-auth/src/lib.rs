//! # tokenbroker-auth
//!
//! Server-side credential lifecycle for the token broker.
//!
//! This crate provides:
//! - OpenID Connect discovery and key-set caching for the external identity
//!   provider
//! - Identity assertion validation
//! - Minting of internal access/refresh credential pairs
//! - Refresh rotation with single-use enforcement and replay detection
//! - Axum handlers for the exchange and refresh endpoints
//!
//! ## Modules
//!
//! - [`config`] - Broker configuration
//! - [`federation`] - Identity provider discovery, key sets and assertion validation
//! - [`token`] - Internal credential codec and the credential service
//! - [`storage`] - Rotation ledger interface and in-memory implementation
//! - [`http`] - Axum HTTP handlers for the broker endpoints

pub mod config;
pub mod error;
pub mod federation;
pub mod http;
pub mod storage;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AuthConfig, ConfigError};
pub use error::{AuthError, ErrorCategory, RefreshRejection};
pub use federation::{
    AssertionValidator, DiscoveryError, IdentityAssertion, KeySetCache, KeySetFetcher,
};
pub use http::{BrokerState, CredentialPairResponse, broker_routes};
pub use storage::{ConsumeOutcome, InMemoryRotationLedger, LedgerEntry, RotationLedger};
pub use token::{CredentialService, IssuedCredentials};

/// Type alias for broker results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tokenbroker_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::config::{AuthConfig, ConfigError};
    pub use crate::error::{AuthError, ErrorCategory, RefreshRejection};
    pub use crate::federation::{AssertionValidator, IdentityAssertion, KeySetCache};
    pub use crate::http::{BrokerState, broker_routes};
    pub use crate::storage::{InMemoryRotationLedger, RotationLedger};
    pub use crate::token::{CredentialService, IssuedCredentials};
}
