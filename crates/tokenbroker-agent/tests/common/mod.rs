#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use p384::ecdsa::SigningKey;
use p384::pkcs8::{EncodePrivateKey, LineEnding};
use serde_json::json;
use tokenbroker_agent::{CredentialSource, SourceError};
use tokenbroker_server::{AppConfig, ServerBuilder};
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const AUDIENCE: &str = "api://tokenbroker";

/// Identity provider backed by a wiremock server and one ES384 key.
pub struct Idp {
    pub server: MockServer,
    encoding_key: EncodingKey,
}

impl Idp {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let secret = p384::SecretKey::random(&mut rand::rngs::OsRng);
        let pem = secret.to_pkcs8_pem(LineEnding::LF).unwrap();
        let encoding_key = EncodingKey::from_ec_pem(pem.as_bytes()).unwrap();
        let point = SigningKey::from(&secret)
            .verifying_key()
            .to_encoded_point(false);

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": server.uri(),
                "jwks_uri": format!("{}/keys", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [{
                    "kty": "EC",
                    "crv": "P-384",
                    "x": URL_SAFE_NO_PAD.encode(point.x().unwrap()),
                    "y": URL_SAFE_NO_PAD.encode(point.y().unwrap()),
                    "kid": "idp-key",
                    "use": "sig",
                    "alg": "ES384",
                }]
            })))
            .mount(&server)
            .await;

        Self {
            server,
            encoding_key,
        }
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn assertion(&self, subject: &str, lifetime_secs: i64) -> String {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = json!({
            "iss": self.issuer(),
            "aud": AUDIENCE,
            "oid": subject,
            "iat": now,
            "nbf": now,
            "exp": now + lifetime_secs,
        });
        let mut header = Header::new(Algorithm::ES384);
        header.kid = Some("idp-key".to_string());
        jsonwebtoken::encode(&header, &claims, &self.encoding_key).unwrap()
    }
}

/// Source handing out a fixed assertion.
pub struct FixedSource(pub Option<String>);

#[async_trait]
impl CredentialSource for FixedSource {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn try_acquire(&self) -> Result<Option<String>, SourceError> {
        Ok(self.0.clone())
    }
}

pub async fn start_broker(idp: &Idp) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let mut cfg = AppConfig::default();
    cfg.auth.identity_provider.issuer = idp.issuer();
    cfg.auth.identity_provider.audience = AUDIENCE.to_string();
    cfg.auth.identity_provider.allowed_algorithms = vec!["ES384".to_string()];
    cfg.auth.key_set.allow_http = true;
    cfg.auth.tokens.signing_secret = "agent-tests-secret-agent-tests-secret".to_string();

    let server = ServerBuilder::new()
        .with_config(cfg)
        .build()
        .expect("build server");
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
