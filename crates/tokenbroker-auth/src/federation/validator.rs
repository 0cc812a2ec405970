//! Identity assertion validation.
//!
//! Verifies tokens issued by the external identity provider: signature
//! against the provider's cached key set, issuer, audience and the
//! `[nbf, exp]` window with symmetric clock-skew tolerance.

use std::str::FromStr;
use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, Header, Validation, decode_header};
use serde::Deserialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use url::Url;

use super::jwks::{KeySetCache, VerificationKey};
use crate::AuthResult;
use crate::config::IdentityProviderConfig;
use crate::error::AuthError;

/// A verified identity provider assertion.
#[derive(Debug, Clone)]
pub struct IdentityAssertion {
    /// `iss` claim.
    pub issuer: String,
    /// Subject drawn from the configured subject claims.
    pub subject: String,
    /// `aud` claim, normalised to a list.
    pub audience: Vec<String>,
    /// Claims other than the registered ones interpreted above.
    pub claims: Map<String, Value>,
    /// `nbf` claim, if present.
    pub not_before: Option<OffsetDateTime>,
    /// `exp` claim.
    pub expiry: OffsetDateTime,
    /// Key id from the header, if present.
    pub key_id: Option<String>,
    /// Signature segment of the compact serialization.
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    #[serde(deserialize_with = "deserialize_audience")]
    aud: Vec<String>,
    exp: i64,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Validates identity assertions for one configured issuer.
pub struct AssertionValidator {
    issuer: Url,
    config: IdentityProviderConfig,
    algorithms: Vec<Algorithm>,
    keys: Arc<KeySetCache>,
}

impl AssertionValidator {
    /// Creates a validator for `config.issuer`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unparseable issuer or an unknown
    /// or symmetric algorithm name.
    pub fn new(config: IdentityProviderConfig, keys: Arc<KeySetCache>) -> AuthResult<Self> {
        let issuer = Url::parse(&config.issuer)
            .map_err(|e| AuthError::configuration(format!("invalid issuer URL: {e}")))?;

        let algorithms = config
            .allowed_algorithms
            .iter()
            .map(|name| {
                let alg = Algorithm::from_str(name).map_err(|_| {
                    AuthError::configuration(format!("unknown signing algorithm: {name}"))
                })?;
                if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                    return Err(AuthError::configuration(format!(
                        "symmetric algorithm {name} cannot verify external assertions"
                    )));
                }
                Ok(alg)
            })
            .collect::<AuthResult<Vec<_>>>()?;

        Ok(Self {
            issuer,
            config,
            algorithms,
            keys,
        })
    }

    /// The issuer this validator accepts.
    #[must_use]
    pub fn issuer(&self) -> &Url {
        &self.issuer
    }

    /// Validates a raw compact assertion.
    ///
    /// An unknown key id forces one key-set refetch before the assertion is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidAssertion` for any signature, claim or
    /// timing failure and `AuthError::Discovery` if no usable key set exists.
    pub async fn validate(&self, raw: &str) -> AuthResult<IdentityAssertion> {
        let header = decode_header(raw)
            .map_err(|e| AuthError::invalid_assertion(format!("malformed assertion: {e}")))?;

        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::invalid_assertion(format!(
                "algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let keys = self.keys.get_keys(&self.issuer).await?;

        let claims = match header.kid.as_deref() {
            Some(kid) => {
                let key = match keys.find(kid) {
                    Some(key) => key.clone(),
                    None => {
                        tracing::info!(kid, issuer = %self.issuer, "Unknown key id, refetching key set");
                        let refreshed = self.keys.force_refetch(&self.issuer, &keys).await?;
                        refreshed.find(kid).cloned().ok_or_else(|| {
                            AuthError::invalid_assertion(format!("signing key {kid} not found"))
                        })?
                    }
                };
                self.decode_with(raw, &header, &key)?
            }
            None => self.decode_with_any(raw, &header, keys.keys())?,
        };

        let assertion = self.build_assertion(raw, header, claims)?;
        tracing::debug!(
            subject = %assertion.subject,
            kid = ?assertion.key_id,
            "Validated identity assertion"
        );

        Ok(assertion)
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.set_issuer(&[self.issuer.as_str().trim_end_matches('/')]);
        validation.set_audience(&[&self.config.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_nbf = true;
        validation.leeway = self.config.clock_skew.as_secs();
        validation
    }

    fn decode_with(
        &self,
        raw: &str,
        header: &Header,
        key: &VerificationKey,
    ) -> AuthResult<AssertionClaims> {
        if !key.permits(header.alg) {
            return Err(AuthError::invalid_assertion(
                "algorithm does not match signing key",
            ));
        }

        let validation = self.validation(header.alg);
        jsonwebtoken::decode::<AssertionClaims>(raw, &key.key, &validation)
            .map(|data| data.claims)
            .map_err(assertion_error)
    }

    /// Tries every signing key; used when the header carries no `kid`.
    fn decode_with_any(
        &self,
        raw: &str,
        header: &Header,
        keys: &[VerificationKey],
    ) -> AuthResult<AssertionClaims> {
        let mut last_error = None;

        for key in keys.iter().filter(|k| k.permits(header.alg)) {
            let validation = self.validation(header.alg);
            match jsonwebtoken::decode::<AssertionClaims>(raw, &key.key, &validation) {
                Ok(data) => return Ok(data.claims),
                // Claims are only checked once the signature verified.
                Err(e) if is_claim_error(e.kind()) => return Err(assertion_error(e)),
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => assertion_error(e),
            None => AuthError::invalid_assertion("no signing key available for algorithm"),
        })
    }

    fn build_assertion(
        &self,
        raw: &str,
        header: Header,
        claims: AssertionClaims,
    ) -> AuthResult<IdentityAssertion> {
        let subject = self
            .config
            .subject_claims
            .iter()
            .find_map(|name| claims.extra.get(name).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AuthError::invalid_assertion("assertion carries no subject"))?
            .to_string();

        let expiry = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| AuthError::invalid_assertion("exp claim out of range"))?;
        let not_before = claims
            .nbf
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|_| AuthError::invalid_assertion("nbf claim out of range"))?;

        let signature = raw.rsplit('.').next().unwrap_or_default().to_string();

        Ok(IdentityAssertion {
            issuer: claims.iss,
            subject,
            audience: claims.aud,
            claims: claims.extra,
            not_before,
            expiry,
            key_id: header.kid,
            signature,
        })
    }
}

fn is_claim_error(kind: &ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ExpiredSignature
            | ErrorKind::ImmatureSignature
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::MissingRequiredClaim(_)
    )
}

fn assertion_error(err: jsonwebtoken::errors::Error) -> AuthError {
    let message = match err.kind() {
        ErrorKind::ExpiredSignature => "assertion has expired".to_string(),
        ErrorKind::ImmatureSignature => "assertion is not yet valid".to_string(),
        ErrorKind::InvalidSignature => "signature verification failed".to_string(),
        ErrorKind::InvalidIssuer => "issuer mismatch".to_string(),
        ErrorKind::InvalidAudience => "audience mismatch".to_string(),
        ErrorKind::InvalidAlgorithm => "algorithm does not match signing key".to_string(),
        ErrorKind::MissingRequiredClaim(claim) => format!("missing required claim: {claim}"),
        _ => format!("malformed assertion: {err}"),
    };
    AuthError::invalid_assertion(message)
}

/// Custom deserializer for audience which can be a string or array.
fn deserialize_audience<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => Ok(vec![s]),
        OneOrMany::Many(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeySetConfig;
    use crate::federation::{DiscoveryError, KeySetFetcher};
    use crate::testing::{AUDIENCE, ISSUER, StaticFetcher, TestIdp, assertion_claims};
    use jsonwebtoken::EncodingKey;
    use std::time::Duration;

    fn provider_config() -> IdentityProviderConfig {
        IdentityProviderConfig {
            issuer: ISSUER.to_string(),
            audience: AUDIENCE.to_string(),
            allowed_algorithms: vec!["ES384".to_string()],
            ..IdentityProviderConfig::default()
        }
    }

    fn validator_for(fetcher: &Arc<StaticFetcher>) -> AssertionValidator {
        let key_config = KeySetConfig {
            forced_refetch_cooldown: Duration::ZERO,
            ..KeySetConfig::default()
        };
        let cache = KeySetCache::new(Arc::clone(fetcher) as Arc<dyn KeySetFetcher>, &key_config);
        AssertionValidator::new(provider_config(), Arc::new(cache)).unwrap()
    }

    fn assert_invalid(err: AuthError, needle: &str) {
        match err {
            AuthError::InvalidAssertion { message } => {
                assert!(message.contains(needle), "unexpected message: {message}");
            }
            other => panic!("expected InvalidAssertion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_valid_assertion() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let raw = idp.sign(&assertion_claims("alice", 3600));
        let assertion = validator.validate(&raw).await.unwrap();

        assert_eq!(assertion.subject, "alice");
        assert_eq!(assertion.issuer, ISSUER);
        assert_eq!(assertion.audience, vec![AUDIENCE.to_string()]);
        assert_eq!(assertion.key_id.as_deref(), Some("key-1"));
        assert!(assertion.not_before.is_some());
        assert!(!assertion.signature.is_empty());
        assert!(assertion.claims.contains_key("oid"));
    }

    #[tokio::test]
    async fn test_subject_falls_back_to_sub() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", 3600);
        claims.as_object_mut().unwrap().remove("oid");
        let assertion = validator.validate(&idp.sign(&claims)).await.unwrap();
        assert_eq!(assertion.subject, "pairwise-alice");
    }

    #[tokio::test]
    async fn test_missing_subject_rejected() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", 3600);
        let obj = claims.as_object_mut().unwrap();
        obj.remove("oid");
        obj.remove("sub");
        let err = validator.validate(&idp.sign(&claims)).await.unwrap_err();
        assert_invalid(err, "no subject");
    }

    #[tokio::test]
    async fn test_expired_assertion_rejected() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", -600);
        claims["nbf"] = serde_json::json!(claims["exp"].as_i64().unwrap() - 3600);
        let err = validator.validate(&idp.sign(&claims)).await.unwrap_err();
        assert_invalid(err, "expired");
    }

    #[tokio::test]
    async fn test_expiry_within_clock_skew_accepted() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", -30);
        claims["nbf"] = serde_json::json!(claims["exp"].as_i64().unwrap() - 3600);
        assert!(validator.validate(&idp.sign(&claims)).await.is_ok());
    }

    #[tokio::test]
    async fn test_not_yet_valid_rejected() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", 7200);
        claims["nbf"] = serde_json::json!(claims["iat"].as_i64().unwrap() + 600);
        let err = validator.validate(&idp.sign(&claims)).await.unwrap_err();
        assert_invalid(err, "not yet valid");
    }

    #[tokio::test]
    async fn test_issuer_and_audience_mismatch() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", 3600);
        claims["iss"] = serde_json::json!("https://evil.example.com");
        let err = validator.validate(&idp.sign(&claims)).await.unwrap_err();
        assert_invalid(err, "issuer");

        let mut claims = assertion_claims("alice", 3600);
        claims["aud"] = serde_json::json!("some-other-app");
        let err = validator.validate(&idp.sign(&claims)).await.unwrap_err();
        assert_invalid(err, "audience");
    }

    #[tokio::test]
    async fn test_array_audience_accepted() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let mut claims = assertion_claims("alice", 3600);
        claims["aud"] = serde_json::json!(["other", AUDIENCE]);
        let assertion = validator.validate(&idp.sign(&claims)).await.unwrap();
        assert_eq!(assertion.audience.len(), 2);
    }

    #[tokio::test]
    async fn test_forged_signature_rejected() {
        let idp = TestIdp::new("key-1");
        let forger = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let raw = forger.sign(&assertion_claims("alice", 3600));
        let err = validator.validate(&raw).await.unwrap_err();
        assert_invalid(err, "signature");
        // Known kid: no forced refetch
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kid_refetches_once_and_accepts_rotated_key() {
        let old = TestIdp::new("old-key");
        let new = TestIdp::new("new-key");
        let fetcher = Arc::new(StaticFetcher::new(old.jwk_set()));
        let validator = validator_for(&fetcher);

        validator
            .validate(&old.sign(&assertion_claims("alice", 3600)))
            .await
            .unwrap();

        fetcher.set_jwk_set(new.jwk_set());
        let assertion = validator
            .validate(&new.sign(&assertion_claims("alice", 3600)))
            .await
            .unwrap();
        assert_eq!(assertion.key_id.as_deref(), Some("new-key"));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_kid_rejected_after_single_refetch() {
        let idp = TestIdp::new("key-1");
        let stranger = TestIdp::new("stranger");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let err = validator
            .validate(&stranger.sign(&assertion_claims("alice", 3600)))
            .await
            .unwrap_err();
        assert_invalid(err, "not found");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_assertion_without_kid_tries_all_keys() {
        let first = TestIdp::new("first");
        let second = TestIdp::new("second");
        let jwks: jsonwebtoken::jwk::JwkSet = serde_json::from_value(serde_json::json!({
            "keys": [first.jwk(), second.jwk()]
        }))
        .unwrap();
        let fetcher = Arc::new(StaticFetcher::new(jwks));
        let validator = validator_for(&fetcher);

        let raw = second.sign_without_kid(&assertion_claims("alice", 3600));
        let assertion = validator.validate(&raw).await.unwrap();
        assert_eq!(assertion.subject, "alice");
        assert!(assertion.key_id.is_none());
    }

    #[tokio::test]
    async fn test_disallowed_algorithm_rejected_without_fetch() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let raw = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(Algorithm::HS256),
            &assertion_claims("alice", 3600),
            &EncodingKey::from_secret(b"guessable"),
        )
        .unwrap();

        let err = validator.validate(&raw).await.unwrap_err();
        assert_invalid(err, "not allowed");
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_garbage_rejected() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let validator = validator_for(&fetcher);

        let err = validator.validate("not-a-jwt").await.unwrap_err();
        assert_invalid(err, "malformed");
    }

    #[tokio::test]
    async fn test_discovery_failure_propagates() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        fetcher.set_failing(true);
        let validator = validator_for(&fetcher);

        let err = validator
            .validate(&idp.sign(&assertion_claims("alice", 3600)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Discovery(DiscoveryError::NetworkError(_))
        ));
    }

    #[test]
    fn test_symmetric_algorithm_refused_in_config() {
        let idp = TestIdp::new("key-1");
        let fetcher = Arc::new(StaticFetcher::new(idp.jwk_set()));
        let cache = KeySetCache::new(fetcher as Arc<dyn KeySetFetcher>, &KeySetConfig::default());

        let config = IdentityProviderConfig {
            allowed_algorithms: vec!["HS256".to_string()],
            ..provider_config()
        };
        assert!(AssertionValidator::new(config, Arc::new(cache)).is_err());
    }
}
