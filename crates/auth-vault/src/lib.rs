//! Core of the auth manager / token vault: crypto, storage trait, IdP
//! client, request authenticator, consent state machine, access-token
//! exchange, and revocation coordinator, plus the HTTP surface that wires
//! them together.

pub mod authenticator;
pub mod config;
pub mod consent;
pub mod crypto;
pub mod error;
pub mod exchange;
pub mod http;
pub mod idp;
pub mod revocation;
pub mod storage;
pub mod types;

pub use error::{VaultError, VaultResult};
