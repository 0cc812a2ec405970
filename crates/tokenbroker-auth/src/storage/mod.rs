//! Storage for broker state.
//!
//! The only server-side state is the refresh credential rotation ledger:
//!
//! - [`RotationLedger`] - storage interface with atomic compare-and-set
//! - [`InMemoryRotationLedger`] - single-instance implementation

pub mod memory;
pub mod rotation_ledger;

pub use memory::InMemoryRotationLedger;
pub use rotation_ledger::{ConsumeOutcome, LedgerEntry, LedgerState, RotationLedger};
