//! HTTP handlers for the broker endpoints.
//!
//! # Available Handlers
//!
//! - [`exchange`] - Assertion exchange, refresh and health endpoints
//! - [`error`] - `IntoResponse` for [`crate::AuthError`]

pub mod error;
pub mod exchange;

pub use exchange::{
    BrokerState, CredentialPairResponse, RefreshRequest, VerifyRequest, broker_routes,
    health_handler, refresh_handler, verify_handler,
};
