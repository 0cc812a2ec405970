//! Refresh credential rotation ledger.
//!
//! This module defines the storage interface tracking the single-use state of
//! every refresh credential the broker has issued.
//!
//! # Security Considerations
//!
//! - `consume` must check and mark in one atomic step per id
//! - A second presentation of a consumed id is a theft signal and is reported
//!   distinctly from expiry
//! - Expired entries should be cleaned up periodically
//!
//! # Implementation Notes
//!
//! Operations on different ids must not serialise against each other. The
//! in-process implementation is [`super::InMemoryRotationLedger`]; a shared
//! store can implement the same trait for multi-replica deployments.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::AuthResult;

/// Single-use state of a refresh credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    /// Issued and not yet redeemed.
    Active,
    /// Redeemed once.
    Consumed {
        /// When the credential was redeemed.
        at: OffsetDateTime,
    },
    /// Invalidated together with its subject's other credentials.
    Revoked {
        /// When the family was revoked.
        at: OffsetDateTime,
    },
}

/// A ledger record for one refresh credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Credential id (the `jti` claim).
    pub id: Uuid,
    /// Subject the credential was issued to.
    pub subject: String,
    /// Issue time.
    pub issued_at: OffsetDateTime,
    /// Expiry time.
    pub expires_at: OffsetDateTime,
    /// Current state.
    pub state: LedgerState,
}

impl LedgerEntry {
    /// Creates an active entry.
    #[must_use]
    pub fn active(
        id: Uuid,
        subject: impl Into<String>,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            subject: subject.into(),
            issued_at,
            expires_at,
            state: LedgerState::Active,
        }
    }

    /// Returns `true` if the entry is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// Result of an atomic consume attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The id was active and is now consumed. The entry is returned as it
    /// was before the transition.
    Consumed(LedgerEntry),
    /// The id had already been consumed.
    AlreadyConsumed(LedgerEntry),
    /// The id belongs to a revoked family.
    Revoked(LedgerEntry),
    /// The id is past its expiry.
    Expired(LedgerEntry),
    /// The id was never recorded (or has been cleaned up).
    Unknown,
}

/// Storage trait for refresh credential single-use state.
#[async_trait]
pub trait RotationLedger: Send + Sync {
    /// Records a freshly issued credential as active.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already recorded or the store fails.
    async fn record(&self, entry: LedgerEntry) -> AuthResult<()>;

    /// Atomically transitions `id` from active to consumed.
    ///
    /// Exactly one of any number of concurrent calls for the same id returns
    /// [`ConsumeOutcome::Consumed`]. The check order is: already consumed,
    /// revoked, expired, then the transition itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    async fn consume(&self, id: Uuid, now: OffsetDateTime) -> AuthResult<ConsumeOutcome>;

    /// Revokes every active credential of `subject`.
    ///
    /// Returns the number of entries revoked.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    async fn revoke_subject(&self, subject: &str, now: OffsetDateTime) -> AuthResult<u64>;

    /// Removes entries expired at `now`.
    ///
    /// Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    async fn cleanup_expired(&self, now: OffsetDateTime) -> AuthResult<u64>;

    /// Looks up an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    async fn get(&self, id: Uuid) -> AuthResult<Option<LedgerEntry>>;
}
