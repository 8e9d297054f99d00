//! Lobster API client.
//!
//! - [`types`]: JSON request and response bodies of the `/api` surface
//! - [`client`]: a `reqwest` client that signs every request with the
//!   `lobster <api_id>:<partial_key>:<nonce>:<signature>` scheme

pub mod client;
pub mod types;

pub use client::{ApiCredentials, ClientError, LobsterClient, PARTIAL_KEY_LEN, authorization_header};
pub use types::*;
