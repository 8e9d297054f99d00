//! Per-(ip, action) rate limiting.
//!
//! Counting and checking are separate queries, so concurrent requests may
//! overshoot `max` slightly.

use crate::error::PanelError;
use crate::storage::{DatabaseError, PanelDatabase};

/// Rows older than this no longer count.
const WINDOW_SECS: i64 = 60 * 60;
/// Rows older than this are deleted by [`cleanup`].
const RETENTION_SECS: i64 = 2 * 60 * 60;

/// Record one occurrence of `action` from `ip`.
pub async fn action(db: &PanelDatabase, ip: &str, action: &str) -> Result<(), DatabaseError> {
    db.antiflood_record(ip, action, WINDOW_SECS).await
}

/// `true` if `ip` has performed `action` fewer than `max` times in the last hour.
pub async fn check(
    db: &PanelDatabase,
    ip: &str,
    action: &str,
    max: i64,
) -> Result<bool, DatabaseError> {
    Ok(!db.antiflood_exceeded(ip, action, max, WINDOW_SECS).await?)
}

/// [`check`], mapped to [`PanelError::TryAgainLater`].
pub async fn require(
    db: &PanelDatabase,
    ip: &str,
    action: &str,
    max: i64,
) -> Result<(), PanelError> {
    if check(db, ip, action, max).await? {
        Ok(())
    } else {
        Err(PanelError::TryAgainLater)
    }
}

pub async fn cleanup(db: &PanelDatabase) -> Result<u64, DatabaseError> {
    db.antiflood_cleanup(RETENTION_SECS).await
}
