//! Lobster control plane library
//!
//! Multi-tenant VM panel:
//! - `SQLite` storage for accounts, VMs, the catalog and the billing ledger
//! - Provider drivers behind a per-region registry
//! - VM lifecycle, hourly billing and bandwidth accounting
//! - Cookie sessions with CSRF tokens, and API keys with signed requests
//! - HTTP panel, admin and API routes, plus the VNC console proxy

pub mod antiflood;
pub mod auth;
pub mod billing;
pub mod catalog;
pub mod driver;
pub mod error;
pub mod jobs;
pub mod mail;
pub mod payment;
pub mod server;
pub mod session;
pub mod storage;
pub mod vm;
pub mod websockify;

#[cfg(test)]
mod test_support;
