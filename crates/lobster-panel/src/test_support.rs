#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

//! Shared fixtures for service and router tests.
//!
//! [`Harness`] wires the services together the way `main` does, against an
//! in-memory database, a [`FakeDriver`] registered for region `test` and a
//! [`RecordingMailer`]. The `fake` payment method credits immediately.

use std::sync::Arc;

use lobster_core::config::Config;
use lobster_core::db::unix_timestamp;

use crate::auth::AuthService;
use crate::billing::{AccountService, Billing, charge_day};
use crate::catalog::CatalogService;
use crate::driver::{DriverRegistry, FakeDriver, VmDriver, VmHandle};
use crate::jobs::Jobs;
use crate::mail::{MailService, RecordingMailer};
use crate::payment::{FakePayment, PaymentRegistry};
use crate::server::AppState;
use crate::storage::{
    ImageParams, ImageStatus, LedgerEntry, PanelDatabase, Plan, PlanParams, User, UserStatus, Vm,
    VmParams,
};
use crate::vm::VmService;
use crate::websockify::Websockify;

pub const REGION: &str = "test";

pub struct Harness {
    pub db: PanelDatabase,
    pub config: Arc<Config>,
    pub driver: Arc<FakeDriver>,
    pub registry: Arc<DriverRegistry>,
    pub mailer: Arc<RecordingMailer>,
    pub mail: MailService,
    pub billing: Billing,
    pub vms: VmService,
    pub accounts: AccountService,
    pub catalog: CatalogService,
    pub auth: AuthService,
    pub payments: Arc<PaymentRegistry>,
    pub websockify: Arc<Websockify>,
}

/// Config tuned for tests: no wait before verifying suspensions.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.default.admin_email = "admin@example.com".to_string();
    config.vm.suspend_verify_delay_secs = 0;
    config
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: Config) -> Harness {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    db.ensure_region(REGION).await.unwrap();
    let config = Arc::new(config);

    let driver = Arc::new(FakeDriver::new());
    let mut registry = DriverRegistry::new();
    registry
        .register(REGION, Arc::clone(&driver) as Arc<dyn VmDriver>)
        .unwrap();
    let registry = Arc::new(registry);

    let mailer = Arc::new(RecordingMailer::default());
    let mail = MailService::new(mailer.clone(), db.clone(), &config);
    let websockify = Arc::new(Websockify::new(&config.novnc.url));
    let billing = Billing::new(
        db.clone(),
        Arc::clone(&registry),
        mail.clone(),
        Arc::clone(&config),
    );
    let vms = VmService::new(
        db.clone(),
        Arc::clone(&registry),
        billing.clone(),
        mail.clone(),
        Arc::clone(&config),
        Arc::clone(&websockify),
    );
    let accounts = AccountService::new(
        db.clone(),
        billing.clone(),
        vms.clone(),
        mail.clone(),
        Arc::clone(&config),
    );
    let catalog = CatalogService::new(db.clone(), Arc::clone(&registry), mail.clone());
    let auth = AuthService::new(db.clone(), mail.clone(), Arc::clone(&config));
    let mut payments = PaymentRegistry::new();
    payments
        .register("fake", Arc::new(FakePayment::new(accounts.clone())))
        .unwrap();

    Harness {
        db,
        config,
        driver,
        registry,
        mailer,
        mail,
        billing,
        vms,
        accounts,
        catalog,
        auth,
        payments: Arc::new(payments),
        websockify,
    }
}

impl Harness {
    pub fn jobs(&self) -> Jobs {
        Jobs::new(self.db.clone(), self.accounts.clone(), self.catalog.clone())
    }

    /// Router state over the harness services.
    pub fn state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            auth: self.auth.clone(),
            vms: self.vms.clone(),
            accounts: self.accounts.clone(),
            catalog: self.catalog.clone(),
            payments: Arc::clone(&self.payments),
            mail: self.mail.clone(),
        }
    }

    /// An active user holding `credit`.
    pub async fn user(&self, username: &str, credit: i64) -> User {
        let user = self
            .db
            .create_user(username, &format!("{username}@example.com"), "salt:hash", 10)
            .await
            .unwrap();
        self.db
            .set_user_status(user.id, UserStatus::Active)
            .await
            .unwrap();
        if credit != 0 {
            self.set_credit(user.id, credit).await;
        }
        self.db.get_user(user.id).await.unwrap()
    }

    /// Move a user's balance to exactly `credit` through the ledger.
    pub async fn set_credit(&self, user_id: i64, credit: i64) {
        let current = self.db.get_user(user_id).await.unwrap().credit;
        let day = charge_day(unix_timestamp());
        self.db
            .record_ledger_entry(
                &LedgerEntry {
                    user_id,
                    name: "Credit updated",
                    detail: "test",
                    key: "test-credit",
                    day: &day,
                    amount: current - credit,
                },
                false,
            )
            .await
            .unwrap();
    }

    /// A global plan priced per hour with `bandwidth` GB per month.
    pub async fn plan(&self, price: i64, bandwidth: i64) -> Plan {
        self.db
            .create_plan(&PlanParams {
                name: "small",
                price,
                ram: 1024,
                cpu: 1,
                storage: 20,
                bandwidth,
                global: true,
            })
            .await
            .unwrap()
    }

    /// A public image in the test region.
    pub async fn image(&self, status: ImageStatus) -> i64 {
        self.db
            .insert_image(&ImageParams {
                user_id: None,
                region: REGION,
                name: "Debian",
                identification: "debian-12",
                status,
                source_vm: None,
            })
            .await
            .unwrap()
            .id
    }

    /// A VM provisioned on the fake driver, bypassing the background task.
    pub async fn active_vm(&self, user_id: i64, plan_id: i64, name: &str) -> Vm {
        let vm = self
            .db
            .insert_vm(&VmParams {
                user_id,
                region: REGION,
                plan_id,
                name,
            })
            .await
            .unwrap();
        let handle = VmHandle::load(&self.db, vm).await.unwrap();
        let identification = self.driver.vm_create(&handle, "debian-12").await.unwrap();
        self.db
            .set_vm_active(handle.vm.id, &identification)
            .await
            .unwrap();
        self.db.get_vm(handle.vm.id).await.unwrap()
    }

    /// Shift a VM's creation and billing marks `secs` into the past.
    pub async fn age_vm(&self, vm_id: i64, secs: i64) {
        sqlx::query(
            "UPDATE vms SET time_created = time_created - ?, time_billed = time_billed - ? WHERE id = ?",
        )
        .bind(secs)
        .bind(secs)
        .bind(vm_id)
        .execute(self.db.pool())
        .await
        .unwrap();
    }
}
