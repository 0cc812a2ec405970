//! Broker configuration.
//!
//! Every component receives its section of this configuration at construction
//! time; nothing in this crate reads environment variables or other ambient
//! process state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Placeholder value shipped in sample configuration files.
pub const PLACEHOLDER_SECRET: &str = "CHANGE_ME_INTERNAL_JWT_SECRET";

/// Minimum signing secret length in bytes (HS256 key size).
pub const MIN_SECRET_LEN: usize = 32;

/// Root configuration for the token broker.
///
/// # Example (TOML)
///
/// ```toml
/// [auth.identity_provider]
/// issuer = "https://login.microsoftonline.com/<tenant>/v2.0"
/// audience = "<application client id>"
///
/// [auth.tokens]
/// signing_secret = "..."
/// access_ttl = "3h"
/// refresh_ttl = "30d"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// External identity provider whose assertions are accepted.
    pub identity_provider: IdentityProviderConfig,

    /// Key-set cache behaviour.
    pub key_set: KeySetConfig,

    /// Internal credential minting.
    pub tokens: TokenConfig,

    /// Rotation ledger housekeeping.
    pub ledger: LedgerConfig,
}

/// Identity provider settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentityProviderConfig {
    /// Expected `iss` claim; also the base of the discovery document URL.
    pub issuer: String,

    /// Expected `aud` claim (the application's client id).
    pub audience: String,

    /// Asymmetric algorithms accepted in assertion headers.
    pub allowed_algorithms: Vec<String>,

    /// Claims consulted in order for the subject; the first present wins.
    pub subject_claims: Vec<String>,

    /// Tolerance applied to both `nbf` and `exp`.
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for IdentityProviderConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            allowed_algorithms: vec!["RS256".to_string()],
            subject_claims: vec!["oid".to_string(), "sub".to_string()],
            clock_skew: Duration::from_secs(120),
        }
    }
}

/// Key-set cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeySetConfig {
    /// How long a fetched key set is served without refetching.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Hard limit on serving a stale key set while the provider is unreachable,
    /// measured from the last successful fetch.
    #[serde(with = "humantime_serde")]
    pub stale_ceiling: Duration,

    /// Minimum age of the cached key set before an unknown key id may force
    /// an early refetch. Within it, an unknown key id is rejected against the
    /// cached set without contacting the provider. Zero disables the limit.
    #[serde(with = "humantime_serde")]
    pub forced_refetch_cooldown: Duration,

    /// HTTP request timeout for discovery and key-set documents.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum accepted response body in bytes.
    pub max_response_size: usize,

    /// Accept plain HTTP provider URLs. Local development and tests only.
    pub allow_http: bool,
}

impl Default for KeySetConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            stale_ceiling: Duration::from_secs(24 * 3600),
            forced_refetch_cooldown: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            max_response_size: 1024 * 1024,
            allow_http: false,
        }
    }
}

/// Internal credential settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// `iss` claim of minted credentials.
    pub issuer: String,

    /// `aud` claim of minted credentials.
    pub audience: String,

    /// HS256 secret used to sign and verify internal credentials.
    pub signing_secret: String,

    /// Access credential lifetime.
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,

    /// Refresh credential lifetime.
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,

    /// Scopes granted when the exchange request names none.
    pub default_scopes: Vec<String>,

    /// Revoke every outstanding refresh credential of a subject when one of
    /// its consumed credentials is presented again.
    pub revoke_family_on_replay: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "tokenbroker".to_string(),
            audience: "tokenbroker".to_string(),
            signing_secret: PLACEHOLDER_SECRET.to_string(),
            access_ttl: Duration::from_secs(3 * 3600),
            refresh_ttl: Duration::from_secs(30 * 24 * 3600),
            default_scopes: Vec::new(),
            revoke_family_on_replay: true,
        }
    }
}

/// Rotation ledger settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Interval between sweeps of expired ledger entries.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(600),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),
}

impl AuthConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` for an empty issuer, audience or secret, and
    /// `ConfigError::InvalidValue` for inconsistent lifetimes, a weak secret, or
    /// an algorithm allow-list that admits symmetric keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let idp = &self.identity_provider;
        if idp.issuer.is_empty() {
            return Err(ConfigError::Missing("identity_provider.issuer".to_string()));
        }
        if url::Url::parse(&idp.issuer).is_err() {
            return Err(ConfigError::InvalidValue(format!(
                "identity_provider.issuer is not a URL: '{}'",
                idp.issuer
            )));
        }
        if idp.audience.is_empty() {
            return Err(ConfigError::Missing(
                "identity_provider.audience".to_string(),
            ));
        }
        if idp.subject_claims.is_empty() {
            return Err(ConfigError::InvalidValue(
                "identity_provider.subject_claims cannot be empty".to_string(),
            ));
        }
        if idp.allowed_algorithms.is_empty() {
            return Err(ConfigError::InvalidValue(
                "identity_provider.allowed_algorithms cannot be empty".to_string(),
            ));
        }
        for alg in &idp.allowed_algorithms {
            match alg.as_str() {
                "RS256" | "RS384" | "RS512" | "PS256" | "PS384" | "PS512" | "ES256" | "ES384"
                | "EdDSA" => {}
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "Unsupported assertion algorithm: '{}'. Only asymmetric algorithms are accepted",
                        other
                    )));
                }
            }
        }

        if self.key_set.ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "key_set.ttl must be > 0".to_string(),
            ));
        }
        if self.key_set.stale_ceiling < self.key_set.ttl {
            return Err(ConfigError::InvalidValue(
                "key_set.stale_ceiling must be >= key_set.ttl".to_string(),
            ));
        }

        let tokens = &self.tokens;
        if tokens.signing_secret.is_empty() {
            return Err(ConfigError::Missing("tokens.signing_secret".to_string()));
        }
        if tokens.signing_secret == PLACEHOLDER_SECRET {
            return Err(ConfigError::InvalidValue(
                "tokens.signing_secret still has the placeholder value".to_string(),
            ));
        }
        if tokens.signing_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::InvalidValue(format!(
                "tokens.signing_secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        if tokens.issuer.is_empty() || tokens.audience.is_empty() {
            return Err(ConfigError::Missing(
                "tokens.issuer and tokens.audience".to_string(),
            ));
        }
        if tokens.access_ttl.is_zero() {
            return Err(ConfigError::InvalidValue(
                "tokens.access_ttl must be > 0".to_string(),
            ));
        }
        if tokens.refresh_ttl <= tokens.access_ttl {
            return Err(ConfigError::InvalidValue(
                "tokens.refresh_ttl must be longer than tokens.access_ttl".to_string(),
            ));
        }

        if self.ledger.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "ledger.cleanup_interval must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
