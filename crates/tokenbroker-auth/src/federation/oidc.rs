//! OpenID Connect Discovery Document types.
//!
//! Only the provider metadata the broker consumes is modelled; unknown fields
//! are ignored on deserialization.

use serde::{Deserialize, Serialize};

/// OpenID Connect Discovery Document.
///
/// Returned from the `.well-known/openid-configuration` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcDiscoveryDocument {
    /// URL that the OP asserts as its Issuer Identifier.
    pub issuer: String,

    /// URL of the OP's JSON Web Key Set document.
    #[serde(default)]
    pub jwks_uri: Option<String>,

    /// URL of the OP's Token Endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,

    /// URL of the OP's Authorization Endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization_endpoint: Option<String>,

    /// URL of the RFC 8628 device authorization endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_authorization_endpoint: Option<String>,

    /// JWS algorithms the OP may use to sign ID Tokens.
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl OidcDiscoveryDocument {
    /// Returns `true` if the OP advertises the given ID Token signing algorithm.
    ///
    /// Providers that omit the list are treated as supporting everything.
    #[must_use]
    pub fn supports_signing_alg(&self, alg: &str) -> bool {
        self.id_token_signing_alg_values_supported.is_empty()
            || self
                .id_token_signing_alg_values_supported
                .iter()
                .any(|a| a == alg)
    }
}
