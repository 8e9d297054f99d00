//! `SQLite` storage for the lobster panel.
//!
//! Provides persistence for users, VMs, plans, images, billing records,
//! API keys, sessions and the anti-flood table.

mod db;
mod models;
mod queries_auth;
mod queries_billing;
mod queries_catalog;
mod queries_users;
mod queries_vms;


pub use db::{DatabaseError, PanelDatabase};
pub use models::*;
pub use queries_auth::ApiKeyParams;
pub use queries_billing::{LedgerEntry, TransactionParams};
pub use queries_catalog::{ImageParams, PlanParams};
pub use queries_vms::VmParams;
