#![allow(dead_code)]

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p384::ecdsa::SigningKey;
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use serde_json::{Value, json};
use tokenbroker_server::{AppConfig, ServerBuilder};
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AUDIENCE: &str = "api://tokenbroker";
pub const SECRET: &str = "integration-secret-integration-secret";

/// Identity provider signing with a single ES384 key.
pub struct TestIdp {
    pub kid: String,
    encoding_key: EncodingKey,
    jwk: Value,
}

impl TestIdp {
    pub fn new(kid: &str) -> Self {
        let secret = p384::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes()).unwrap();
        let point = SigningKey::from(&secret)
            .verifying_key()
            .to_encoded_point(false);

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

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES384);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key).unwrap()
    }

    /// Signs an assertion for `subject` valid for `lifetime_secs`.
    pub fn assertion(&self, issuer: &str, subject: &str, lifetime_secs: i64) -> String {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.sign(&json!({
            "iss": issuer,
            "aud": AUDIENCE,
            "oid": subject,
            "iat": now,
            "nbf": now.min(now + lifetime_secs),
            "exp": now + lifetime_secs,
        }))
    }
}

/// Mounts the discovery document and key set of `idp`. The key set must be
/// fetched exactly `expected_fetches` times.
pub async fn mount_idp(server: &MockServer, idp: &TestIdp, expected_fetches: u64) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "jwks_uri": format!("{}/keys", server.uri()),
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/keys"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": [idp.jwk] })))
        .expect(expected_fetches)
        .mount(server)
        .await;
}

pub fn test_config(issuer: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.auth.identity_provider.issuer = issuer.to_string();
    cfg.auth.identity_provider.audience = AUDIENCE.to_string();
    cfg.auth.identity_provider.allowed_algorithms = vec!["ES384".to_string()];
    cfg.auth.key_set.allow_http = true;
    cfg.auth.tokens.signing_secret = SECRET.to_string();
    cfg
}

pub async fn start_server(cfg: AppConfig) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let server = ServerBuilder::new()
        .with_config(cfg)
        .build()
        .expect("build server");

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = server
            .serve(listener, async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, handle)
}
