//! OpenID Connect Discovery client.
//!
//! Fetches provider metadata from `{issuer}/.well-known/openid-configuration`
//! and the key set document it points to.
//!
//! # Security Considerations
//!
//! - Only HTTPS URLs are allowed (unless `allow_http` is configured)
//! - The issuer claim in the discovery document must match the expected issuer URL
//! - HTTP timeouts prevent hanging on slow endpoints
//! - Response bodies are size-limited
//!
//! # References
//!
//! - [OpenID Connect Discovery 1.0](https://openid.net/specs/openid-connect-discovery-1_0.html)

use jsonwebtoken::jwk::JwkSet;
use serde::de::DeserializeOwned;
use url::Url;

use super::oidc::OidcDiscoveryDocument;
use crate::config::KeySetConfig;

/// Errors that can occur while fetching provider metadata or keys.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A network error occurred while fetching a document.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The HTTP request returned a non-success status code.
    #[error("HTTP error: status {0}")]
    HttpError(u16),

    /// The document could not be parsed as JSON.
    #[error("Failed to parse provider document: {0}")]
    ParseError(String),

    /// The issuer URL could not be parsed or is invalid.
    #[error("Invalid issuer URL: {0}")]
    InvalidIssuer(String),

    /// The issuer in the discovery document does not match the expected issuer.
    #[error("Issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// The expected issuer URL.
        expected: String,
        /// The actual issuer URL from the discovery document.
        actual: String,
    },

    /// A required field is missing from the discovery document.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// The URL scheme is not allowed (must be HTTPS in production).
    #[error("Invalid URL scheme: {0} (only HTTPS is allowed)")]
    InvalidScheme(String),

    /// The response exceeded the maximum allowed size.
    #[error("Response exceeds maximum size of {max_size} bytes")]
    ResponseTooLarge {
        /// The maximum allowed size.
        max_size: usize,
    },

    /// The provider is unreachable and the cached key set is too old to serve.
    #[error("Cached key set for {issuer} is {age_secs}s old, beyond the stale ceiling")]
    StaleCeilingExceeded {
        /// The issuer whose keys could not be refreshed.
        issuer: String,
        /// Age of the cached key set in seconds.
        age_secs: u64,
    },
}

/// Client for fetching OIDC discovery documents and key sets.
#[derive(Debug, Clone)]
pub struct OidcDiscoveryClient {
    http_client: reqwest::Client,
    max_response_size: usize,
    allow_http: bool,
}

impl OidcDiscoveryClient {
    /// Creates a new discovery client.
    ///
    /// # Errors
    ///
    /// Returns `DiscoveryError::NetworkError` if the HTTP client cannot be built.
    pub fn new(config: &KeySetConfig) -> Result<Self, DiscoveryError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DiscoveryError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            max_response_size: config.max_response_size,
            allow_http: config.allow_http,
        })
    }

    /// Discovers OIDC configuration from an issuer URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the issuer URL is not HTTPS (unless `allow_http` is
    /// set), the document cannot be fetched or parsed, or its `issuer` does not
    /// match the expected issuer.
    pub async fn discover(&self, issuer: &Url) -> Result<OidcDiscoveryDocument, DiscoveryError> {
        let discovery_url = build_discovery_url(issuer);
        let document: OidcDiscoveryDocument = self.get_json(&discovery_url).await?;

        validate_issuer(&document, issuer)?;

        tracing::debug!(
            "Successfully discovered OIDC configuration for {}",
            document.issuer
        );

        Ok(document)
    }

    /// Fetches the key set document at `jwks_uri`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URI scheme is not allowed, the request fails,
    /// or the response is not a valid JWK set.
    pub async fn fetch_key_set(&self, jwks_uri: &Url) -> Result<JwkSet, DiscoveryError> {
        tracing::debug!("Fetching JWKS from {}", jwks_uri);
        let jwks: JwkSet = self.get_json(jwks_uri).await?;
        tracing::debug!("Fetched JWKS from {} with {} keys", jwks_uri, jwks.keys.len());
        Ok(jwks)
    }

    /// Discovers the issuer and fetches its key set in one step.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Self::discover`] or [`Self::fetch_key_set`], or
    /// `DiscoveryError::MissingField` if the document has no `jwks_uri`.
    pub async fn discover_key_set(&self, issuer: &Url) -> Result<JwkSet, DiscoveryError> {
        let document = self.discover(issuer).await?;
        let jwks_uri = document
            .jwks_uri
            .as_deref()
            .ok_or_else(|| DiscoveryError::MissingField("jwks_uri".to_string()))?;
        let jwks_uri = Url::parse(jwks_uri)
            .map_err(|e| DiscoveryError::ParseError(format!("invalid jwks_uri: {}", e)))?;
        self.fetch_key_set(&jwks_uri).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, DiscoveryError> {
        self.validate_scheme(url)?;

        let response = self
            .http_client
            .get(url.as_str())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("Failed to fetch {}: {}", url, e);
                DiscoveryError::NetworkError(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(DiscoveryError::HttpError(response.status().as_u16()));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.max_response_size
        {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.max_response_size,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DiscoveryError::NetworkError(e.to_string()))?;
        // Chunked responses carry no content length
        if body.len() > self.max_response_size {
            return Err(DiscoveryError::ResponseTooLarge {
                max_size: self.max_response_size,
            });
        }

        serde_json::from_slice(&body).map_err(|e| {
            tracing::warn!("Failed to parse document from {}: {}", url, e);
            DiscoveryError::ParseError(e.to_string())
        })
    }

    fn validate_scheme(&self, url: &Url) -> Result<(), DiscoveryError> {
        match url.scheme() {
            "https" => Ok(()),
            "http" if self.allow_http => Ok(()),
            other => Err(DiscoveryError::InvalidScheme(other.to_string())),
        }
    }
}

/// Builds `{issuer}/.well-known/openid-configuration`.
fn build_discovery_url(issuer: &Url) -> Url {
    let mut discovery_url = issuer.clone();
    let path = issuer.path().trim_end_matches('/');
    discovery_url.set_path(&format!("{}/.well-known/openid-configuration", path));
    discovery_url
}

/// The document's issuer must be identical to the URL used to retrieve it
/// (OIDC Discovery 1.0, section 4.3), ignoring a trailing slash.
fn validate_issuer(
    document: &OidcDiscoveryDocument,
    expected: &Url,
) -> Result<(), DiscoveryError> {
    let document_issuer = Url::parse(&document.issuer).map_err(|e| {
        DiscoveryError::InvalidIssuer(format!(
            "Invalid issuer URL in document: {} - {}",
            document.issuer, e
        ))
    })?;

    let expected_normalized = expected.as_str().trim_end_matches('/');
    let document_normalized = document_issuer.as_str().trim_end_matches('/');

    if expected_normalized != document_normalized {
        return Err(DiscoveryError::IssuerMismatch {
            expected: expected_normalized.to_string(),
            actual: document_normalized.to_string(),
        });
    }

    Ok(())
}
