//! Lobster Core Library
//!
//! Shared functionality for Lobster components:
//! - Configuration model, loading and validation
//! - `SQLite` pool helpers and the `define_database!` macro
//! - Wildcard matching used by API key restrictions
//! - Text validation helpers
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod matcher;
pub mod text;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use matcher::wildcard_match;

/// Credit amounts are integers in units of 1 / `BILLING_PRECISION` of the currency.
pub const BILLING_PRECISION: i64 = 1_000_000;
