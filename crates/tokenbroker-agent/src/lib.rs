//! Client side of tokenbroker: acquires an identity assertion, exchanges it
//! for an internal credential pair and keeps that pair refreshed.

pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod scheduler;
pub mod session;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{BrokerApi, CredentialPair, HttpBroker};
pub use config::AgentConfig;
pub use error::{AgentError, BrokerError, SourceError};
pub use manager::{SessionManager, SessionStatus};
pub use scheduler::RefreshScheduler;
pub use session::{SessionState, SessionStore};
pub use sources::CredentialSource;
