//! Internal credential generation, validation, and rotation.
//!
//! This module provides:
//!
//! - HS256 encoding and decoding of internal credentials
//! - Credential pair minting on assertion exchange
//! - Refresh redemption against the rotation ledger

pub mod jwt;
pub mod service;

pub use jwt::{CredentialKind, InternalClaims, JwtError, JwtService};
pub use service::{AccessCredential, CredentialService, IssuedCredentials, RefreshCredential};
