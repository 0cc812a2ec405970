//! External identity provider federation.
//!
//! This module provides the provider-facing side of the broker:
//!
//! - OpenID Connect discovery of the key-set location
//! - Key-set caching with single-flight refetch and a stale ceiling
//! - Identity assertion validation

pub mod discovery;
pub mod jwks;
pub mod oidc;
pub mod validator;

pub use discovery::{DiscoveryError, OidcDiscoveryClient};
pub use jwks::{HttpKeySetFetcher, KeySet, KeySetCache, KeySetFetcher, VerificationKey};
pub use oidc::OidcDiscoveryDocument;
pub use validator::{AssertionValidator, IdentityAssertion};
