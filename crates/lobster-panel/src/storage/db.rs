//! `SQLite` database for the lobster panel.

pub use lobster_core::db::DatabaseError;

lobster_core::define_database!(PanelDatabase, "Panel database migrations complete");
