//! In-process rotation ledger.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;
use uuid::Uuid;

use super::rotation_ledger::{ConsumeOutcome, LedgerEntry, LedgerState, RotationLedger};
use crate::AuthResult;
use crate::error::AuthError;

/// Rotation ledger held in a sharded concurrent map.
///
/// `consume` holds the shard write lock of one id for the check-and-mark, so
/// redemptions of different ids proceed in parallel. State is lost on
/// restart, which leaves outstanding refresh credentials unknown.
#[derive(Debug, Default)]
pub struct InMemoryRotationLedger {
    entries: DashMap<Uuid, LedgerEntry>,
}

impl InMemoryRotationLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl RotationLedger for InMemoryRotationLedger {
    async fn record(&self, entry: LedgerEntry) -> AuthResult<()> {
        match self.entries.entry(entry.id) {
            Entry::Occupied(_) => Err(AuthError::storage(format!(
                "refresh credential {} already recorded",
                entry.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    async fn consume(&self, id: Uuid, now: OffsetDateTime) -> AuthResult<ConsumeOutcome> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Ok(ConsumeOutcome::Unknown);
        };

        let outcome = match entry.state {
            LedgerState::Consumed { .. } => ConsumeOutcome::AlreadyConsumed(entry.clone()),
            LedgerState::Revoked { .. } => ConsumeOutcome::Revoked(entry.clone()),
            LedgerState::Active if entry.is_expired(now) => ConsumeOutcome::Expired(entry.clone()),
            LedgerState::Active => {
                let before = entry.clone();
                entry.state = LedgerState::Consumed { at: now };
                ConsumeOutcome::Consumed(before)
            }
        };

        Ok(outcome)
    }

    async fn revoke_subject(&self, subject: &str, now: OffsetDateTime) -> AuthResult<u64> {
        let mut revoked = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.subject == subject && entry.state == LedgerState::Active {
                entry.state = LedgerState::Revoked { at: now };
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn cleanup_expired(&self, now: OffsetDateTime) -> AuthResult<u64> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn get(&self, id: Uuid) -> AuthResult<Option<LedgerEntry>> {
        Ok(self.entries.get(&id).map(|e| e.clone()))
    }
}
