//! Credential service for minting and rotating internal credentials.
//!
//! This module provides the broker operations behind the HTTP surface:
//!
//! - Identity assertion exchange
//! - Refresh credential redemption with rotation and replay detection
//! - Access credential verification for embedding services
//!
//! # Usage
//!
//! ```ignore
//! use tokenbroker_auth::token::CredentialService;
//!
//! let service = CredentialService::from_config(&config)?;
//! let pair = service.exchange(&raw_assertion, None).await?;
//! let rotated = service.redeem(&pair.refresh.token).await?;
//! ```

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthResult;
use crate::config::{AuthConfig, TokenConfig};
use crate::error::{AuthError, RefreshRejection};
use crate::federation::{AssertionValidator, KeySetCache};
use crate::storage::{ConsumeOutcome, InMemoryRotationLedger, LedgerEntry, RotationLedger};
use crate::token::jwt::{CredentialKind, InternalClaims, JwtError, JwtService};

/// A minted access credential.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    /// Signed compact token.
    pub token: String,
    /// Subject.
    pub subject: String,
    /// Issue time.
    pub issued_at: OffsetDateTime,
    /// Expiry, `issued_at + access_ttl`.
    pub expires_at: OffsetDateTime,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Device the pair was issued to.
    pub device_id: Option<String>,
}

/// A minted refresh credential.
#[derive(Debug, Clone)]
pub struct RefreshCredential {
    /// Signed compact token.
    pub token: String,
    /// Ledger id.
    pub id: Uuid,
    /// Subject.
    pub subject: String,
    /// Issue time.
    pub issued_at: OffsetDateTime,
    /// Expiry, `issued_at + refresh_ttl`.
    pub expires_at: OffsetDateTime,
}

/// An access/refresh credential pair.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    /// Access credential.
    pub access: AccessCredential,
    /// Refresh credential.
    pub refresh: RefreshCredential,
}

/// Mints, exchanges and rotates internal credentials.
pub struct CredentialService {
    /// Codec for internal credentials.
    jwt: JwtService,

    /// Single-use state of refresh credentials.
    ledger: Arc<dyn RotationLedger>,

    /// Validator for external identity assertions.
    validator: Arc<AssertionValidator>,

    /// Service configuration.
    config: TokenConfig,
}

impl CredentialService {
    /// Creates a new credential service.
    #[must_use]
    pub fn new(
        config: TokenConfig,
        validator: Arc<AssertionValidator>,
        ledger: Arc<dyn RotationLedger>,
    ) -> Self {
        let jwt = JwtService::new(
            config.signing_secret.as_bytes(),
            config.issuer.clone(),
            config.audience.clone(),
        );
        Self {
            jwt,
            ledger,
            validator,
            config,
        }
    }

    /// Builds the full component stack for a single instance: HTTP key-set
    /// cache, assertion validator and in-memory ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn from_config(config: &AuthConfig) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;

        let keys = KeySetCache::with_http(&config.key_set)?;
        let validator = AssertionValidator::new(config.identity_provider.clone(), Arc::new(keys))?;

        Ok(Self::new(
            config.tokens.clone(),
            Arc::new(validator),
            Arc::new(InMemoryRotationLedger::new()),
        ))
    }

    /// Mints a new credential pair for `subject` and records the refresh id.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidRequest` for an empty subject, or an error
    /// if encoding or the ledger write fails.
    pub async fn mint(
        &self,
        subject: &str,
        scopes: &[String],
        device_id: Option<&str>,
    ) -> AuthResult<IssuedCredentials> {
        if subject.is_empty() {
            return Err(AuthError::invalid_request("subject must not be empty"));
        }

        let now = OffsetDateTime::now_utc();
        let access_expiry = now + self.config.access_ttl;
        let refresh_expiry = now + self.config.refresh_ttl;
        let refresh_id = Uuid::new_v4();
        let scope = (!scopes.is_empty()).then(|| scopes.join(" "));

        let access_claims = self.claims(
            CredentialKind::Access,
            subject,
            now,
            access_expiry,
            Uuid::new_v4(),
            scope.clone(),
            device_id,
        );
        let refresh_claims = self.claims(
            CredentialKind::Refresh,
            subject,
            now,
            refresh_expiry,
            refresh_id,
            scope,
            device_id,
        );

        let access_token = self
            .jwt
            .encode(&access_claims)
            .map_err(|e| AuthError::internal(format!("Failed to encode access credential: {}", e)))?;
        let refresh_token = self
            .jwt
            .encode(&refresh_claims)
            .map_err(|e| AuthError::internal(format!("Failed to encode refresh credential: {}", e)))?;

        self.ledger
            .record(LedgerEntry::active(refresh_id, subject, now, refresh_expiry))
            .await?;

        Ok(IssuedCredentials {
            access: AccessCredential {
                token: access_token,
                subject: subject.to_string(),
                issued_at: now,
                expires_at: access_expiry,
                scopes: scopes.to_vec(),
                device_id: device_id.map(str::to_string),
            },
            refresh: RefreshCredential {
                token: refresh_token,
                id: refresh_id,
                subject: subject.to_string(),
                issued_at: now,
                expires_at: refresh_expiry,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn claims(
        &self,
        typ: CredentialKind,
        subject: &str,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
        jti: Uuid,
        scope: Option<String>,
        device_id: Option<&str>,
    ) -> InternalClaims {
        InternalClaims {
            iss: self.jwt.issuer().to_string(),
            sub: subject.to_string(),
            aud: self.jwt.audience().to_string(),
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: jti.to_string(),
            typ,
            scope,
            device_id: device_id.map(str::to_string),
        }
    }

    /// Validates an external identity assertion and mints a pair for its
    /// subject with the default scopes.
    ///
    /// # Errors
    ///
    /// Returns whatever assertion validation signals, or a minting error.
    pub async fn exchange(
        &self,
        raw_assertion: &str,
        device_id: Option<&str>,
    ) -> AuthResult<IssuedCredentials> {
        let assertion = self.validator.validate(raw_assertion).await?;
        let issued = self
            .mint(&assertion.subject, &self.config.default_scopes, device_id)
            .await?;

        tracing::info!(
            subject = %assertion.subject,
            refresh_id = %issued.refresh.id,
            device_id = ?device_id,
            "Issued credentials for identity assertion"
        );

        Ok(issued)
    }

    /// Redeems a refresh credential for a new pair, consuming it.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::RefreshRejected` if the credential is malformed,
    /// unknown, expired, revoked or already consumed. On the last, the
    /// subject's credential family is revoked when `revoke_family_on_replay`
    /// is set.
    pub async fn redeem(&self, raw_refresh: &str) -> AuthResult<IssuedCredentials> {
        let claims = self
            .jwt
            .decode(raw_refresh, CredentialKind::Refresh)
            .map_err(|e| {
                let reason = match e {
                    JwtError::Expired => RefreshRejection::Expired,
                    _ => RefreshRejection::Malformed,
                };
                tracing::warn!(reason = reason.as_str(), "Refresh credential rejected: {}", e);
                AuthError::refresh_rejected(reason)
            })?;

        let id = Uuid::parse_str(&claims.jti).map_err(|_| {
            tracing::warn!(subject = %claims.sub, "Refresh credential carries an invalid id");
            AuthError::refresh_rejected(RefreshRejection::Malformed)
        })?;

        let now = OffsetDateTime::now_utc();
        match self.ledger.consume(id, now).await? {
            ConsumeOutcome::Consumed(entry) => {
                if entry.subject != claims.sub {
                    tracing::warn!(
                        refresh_id = %id,
                        "Refresh credential subject does not match its ledger entry"
                    );
                    return Err(AuthError::refresh_rejected(RefreshRejection::Unknown));
                }

                let issued = self
                    .mint(&claims.sub, &claims.scopes(), claims.device_id.as_deref())
                    .await?;
                tracing::info!(
                    subject = %claims.sub,
                    consumed_id = %id,
                    refresh_id = %issued.refresh.id,
                    "Rotated refresh credential"
                );
                Ok(issued)
            }
            ConsumeOutcome::AlreadyConsumed(entry) => {
                tracing::error!(
                    subject = %entry.subject,
                    refresh_id = %id,
                    "Consumed refresh credential presented again, possible replay"
                );
                if self.config.revoke_family_on_replay {
                    let revoked = self.ledger.revoke_subject(&entry.subject, now).await?;
                    tracing::warn!(
                        subject = %entry.subject,
                        revoked,
                        "Revoked outstanding refresh credentials after replay"
                    );
                }
                Err(AuthError::refresh_rejected(RefreshRejection::AlreadyConsumed))
            }
            ConsumeOutcome::Revoked(entry) => {
                tracing::warn!(subject = %entry.subject, refresh_id = %id, "Revoked refresh credential presented");
                Err(AuthError::refresh_rejected(RefreshRejection::Revoked))
            }
            ConsumeOutcome::Expired(entry) => {
                tracing::warn!(subject = %entry.subject, refresh_id = %id, "Expired refresh credential presented");
                Err(AuthError::refresh_rejected(RefreshRejection::Expired))
            }
            ConsumeOutcome::Unknown => {
                tracing::warn!(subject = %claims.sub, refresh_id = %id, "Unknown refresh credential presented");
                Err(AuthError::refresh_rejected(RefreshRejection::Unknown))
            }
        }
    }

    /// Verifies an internal access credential and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` if the credential does not verify,
    /// has expired, or is not an access credential.
    pub fn verify_access(&self, token: &str) -> AuthResult<InternalClaims> {
        self.jwt
            .decode(token, CredentialKind::Access)
            .map_err(|e| AuthError::invalid_token(e.to_string()))
    }

    /// Gets the rotation ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn RotationLedger> {
        &self.ledger
    }

    /// Gets the service configuration.
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }
}
