//! Shared fixtures for unit tests: an ES384 identity provider and a
//! controllable key-set fetcher.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p384::ecdsa::SigningKey;
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use serde_json::{Value, json};
use url::Url;

use crate::federation::{DiscoveryError, KeySetFetcher};

pub(crate) const ISSUER: &str = "https://login.example.com/tenant/v2.0";
pub(crate) const AUDIENCE: &str = "api://tokenbroker";

/// An identity provider signing with one ES384 key.
pub(crate) struct TestIdp {
    pub kid: String,
    encoding_key: EncodingKey,
    jwk: Value,
}

impl TestIdp {
    pub fn new(kid: &str) -> Self {
        let secret = p384::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes()).unwrap();

        let signing_key = SigningKey::from(&secret);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let jwk = json!({
            "kty": "EC",
            "crv": "P-384",
            "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
            "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
            "kid": kid,
            "use": "sig",
            "alg": "ES384",
        });

        Self {
            kid: kid.to_string(),
            encoding_key,
            jwk,
        }
    }

    pub fn jwk(&self) -> Value {
        self.jwk.clone()
    }

    pub fn jwk_set(&self) -> JwkSet {
        serde_json::from_value(json!({ "keys": [self.jwk()] })).unwrap()
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES384);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).unwrap()
    }

    pub fn sign_without_kid(&self, claims: &Value) -> String {
        let header = Header::new(Algorithm::ES384);
        jsonwebtoken::encode(&header, claims, &self.encoding_key).unwrap()
    }
}

/// Claims of a well-formed assertion for `subject`, valid for `lifetime_secs`.
pub(crate) fn assertion_claims(subject: &str, lifetime_secs: i64) -> Value {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "oid": subject,
        "sub": format!("pairwise-{subject}"),
        "iat": now,
        "nbf": now,
        "exp": now + lifetime_secs,
    })
}

/// Fetcher serving a replaceable key set and counting calls.
pub(crate) struct StaticFetcher {
    jwks: Mutex<JwkSet>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Duration,
}

impl StaticFetcher {
    pub fn new(jwks: JwkSet) -> Self {
        Self {
            jwks: Mutex::new(jwks),
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_jwk_set(&self, jwks: JwkSet) {
        *self.jwks.lock().unwrap() = jwks;
    }
}

#[async_trait]
impl KeySetFetcher for StaticFetcher {
    async fn fetch(&self, _issuer: &Url) -> Result<JwkSet, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DiscoveryError::NetworkError("connection refused".into()));
        }
        Ok(self.jwks.lock().unwrap().clone())
    }
}
