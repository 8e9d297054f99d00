//! Periodic background work.
//!
//! `cron` runs once a minute: the billing pass and expiry of sessions,
//! form tokens, anti-flood rows and reset tokens. `cache` runs every few
//! seconds and settles pending image imports.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::antiflood;
use crate::auth::PWRESET_EXPIRE_SECS;
use crate::billing::AccountService;
use crate::catalog::CatalogService;
use crate::session::{FORM_TOKEN_MAX_AGE_SECS, SESSION_MAX_AGE_SECS};
use crate::storage::{DatabaseError, PanelDatabase};

pub const CRON_INTERVAL: Duration = Duration::from_secs(60);
pub const CACHE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Jobs {
    db: PanelDatabase,
    accounts: AccountService,
    catalog: CatalogService,
}

impl Jobs {
    pub const fn new(db: PanelDatabase, accounts: AccountService, catalog: CatalogService) -> Self {
        Self {
            db,
            accounts,
            catalog,
        }
    }

    /// One run of the minute job. Each step runs even if an earlier one
    /// failed; the first error is returned.
    pub async fn cron(&self) -> Result<(), DatabaseError> {
        let billing = self.accounts.billing_pass().await;
        let cleanup = self.cleanup().await;
        billing.and(cleanup)
    }

    async fn cleanup(&self) -> Result<(), DatabaseError> {
        let form_tokens = self.db.cleanup_form_tokens(FORM_TOKEN_MAX_AGE_SECS).await?;
        let sessions = self.db.cleanup_sessions(SESSION_MAX_AGE_SECS).await?;
        let antiflood = antiflood::cleanup(&self.db).await?;
        let pwreset = self.db.cleanup_pwreset_tokens(PWRESET_EXPIRE_SECS).await?;
        if form_tokens + sessions + antiflood + pwreset > 0 {
            debug!(form_tokens, sessions, antiflood, pwreset, "Expired rows removed");
        }
        Ok(())
    }

    pub async fn cache(&self) {
        if let Err(e) = self.catalog.refresh_pending_images().await {
            warn!(error = %e, "Pending image refresh failed");
        }
    }

    /// Start both loops. The first tick of each is skipped so nothing runs
    /// during startup.
    pub fn spawn(self) -> (JoinHandle<()>, JoinHandle<()>) {
        let cron_jobs = self.clone();
        let cron = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CRON_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = cron_jobs.cron().await {
                    warn!(error = %e, "Cron run failed");
                }
            }
        });

        let cache = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.cache().await;
            }
        });

        (cron, cache)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::{REGION, harness};
    use crate::storage::{ImageParams, ImageStatus};

    async fn age(db: &PanelDatabase, table: &str, column: &str, secs: i64) {
        sqlx::query(&format!("UPDATE {table} SET {column} = {column} - ?"))
            .bind(secs)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cron_expires_stale_rows() {
        let h = harness().await;
        let jobs = h.jobs();
        let user = h.user("alice", 0).await;

        let session = h.db.create_session(&"a".repeat(64)).await.unwrap();
        h.db.insert_form_token(&session.uid, "t1").await.unwrap();
        h.db.create_pwreset_token(user.id, "reset").await.unwrap();
        antiflood::action(&h.db, "ip", "authCheck").await.unwrap();

        jobs.cron().await.unwrap();
        assert!(h.db.get_session(&session.uid, SESSION_MAX_AGE_SECS).await.unwrap().is_some());

        age(&h.db, "sessions", "active_time", 2 * 3600).await;
        age(&h.db, "form_tokens", "time", 2 * 3600).await;
        age(&h.db, "pwreset_tokens", "time", 2 * 3600).await;
        age(&h.db, "antiflood", "time", 3 * 3600).await;
        jobs.cron().await.unwrap();

        assert!(h.db.get_session(&session.uid, i64::MAX).await.unwrap().is_none());
        assert!(!h.db.consume_form_token(&session.uid, "t1", i64::MAX).await.unwrap());
        assert!(!h.db.consume_pwreset_token(user.id, "reset", i64::MAX).await.unwrap());
        assert_eq!(antiflood::cleanup(&h.db).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cache_settles_pending_images() {
        let h = harness().await;
        let image = h
            .db
            .insert_image(&ImageParams {
                user_id: None,
                region: REGION,
                name: "import",
                identification: "fake-image",
                status: ImageStatus::Pending,
                source_vm: None,
            })
            .await
            .unwrap();

        h.jobs().cache().await;
        assert_eq!(
            h.db.get_image(image.id).await.unwrap().status,
            ImageStatus::Active
        );
    }
}
