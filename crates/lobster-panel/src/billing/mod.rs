//! Metering and charging.
//!
//! VM time is billed in fixed intervals, image storage by the hour and
//! bandwidth against a monthly per-region allocation. Every debit goes
//! through [`Billing::apply_charge`], which folds same-day charges with the
//! same key into one ledger line.

mod account;
mod bandwidth;


pub use account::AccountService;
pub use bandwidth::BandwidthSummary;

use std::sync::Arc;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use lobster_core::config::Config;
use lobster_core::db::unix_timestamp;

use crate::driver::{DriverRegistry, VmHandle};
use crate::error::{PanelError, PanelResult};
use crate::mail::MailService;
use crate::storage::{Charge, DatabaseError, LedgerEntry, PanelDatabase, Plan, Vm, VmStatus};

pub const GIB: i64 = 1024 * 1024 * 1024;

/// Allowance in GiB added on top of the prorated plan bandwidth when a VM
/// leaves a user's pool.
const REFUND_TOLERANCE_GIB: f64 = 15.0;

/// Burn rate and runway of a user's account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditSummary {
    pub credit: i64,
    pub hourly: i64,
    pub daily: i64,
    pub monthly: i64,
    /// Whole days of runway, or `"infinite"` when nothing is billed.
    pub days_remaining: String,
    /// `danger`, `warning` or `success`.
    pub status: &'static str,
}

/// `YYYY-MM-DD` of a Unix timestamp, in UTC.
pub fn charge_day(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

fn midnight(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// Start and end (exclusive) of the UTC calendar month containing `ts`.
pub fn month_bounds(ts: i64) -> (i64, i64) {
    let date = DateTime::<Utc>::from_timestamp(ts, 0)
        .unwrap_or_default()
        .date_naive();
    let start = NaiveDate::from_ymd_opt(date.year(), date.month(), 1);
    let end = start.and_then(|s| s.checked_add_months(Months::new(1)));
    match (start, end) {
        (Some(start), Some(end)) => (midnight(start), midnight(end)),
        _ => (ts, ts + 30 * 24 * 3600),
    }
}

/// Share of the plan bandwidth a VM has used up this month when it leaves
/// the pool at `now`, capped at the whole month.
#[allow(clippy::cast_precision_loss)]
fn elapsed_month_fraction(time_created: i64, now: i64) -> f64 {
    let (month_start, month_end) = month_bounds(now);
    let from = time_created.max(month_start);
    let fraction = (now - from) as f64 / (month_end - month_start) as f64;
    fraction.clamp(0.0, 1.0)
}

#[derive(Clone)]
pub struct Billing {
    db: PanelDatabase,
    registry: Arc<DriverRegistry>,
    mail: MailService,
    config: Arc<Config>,
}

impl Billing {
    pub const fn new(
        db: PanelDatabase,
        registry: Arc<DriverRegistry>,
        mail: MailService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            registry,
            mail,
            config,
        }
    }

    /// Debit `amount` from a user under `key`, accumulating with earlier
    /// charges of the same key today.
    pub async fn apply_charge(
        &self,
        user_id: i64,
        name: &str,
        detail: &str,
        key: &str,
        amount: i64,
    ) -> Result<(), DatabaseError> {
        let day = charge_day(unix_timestamp());
        self.db
            .record_ledger_entry(
                &LedgerEntry {
                    user_id,
                    name,
                    detail,
                    key,
                    day: &day,
                    amount,
                },
                false,
            )
            .await
    }

    /// Bill the elapsed intervals of one VM and meter its traffic.
    ///
    /// With `terminating`, the current partial interval is billed too and
    /// the lifetime total is raised to the configured minimum.
    #[instrument(skip(self))]
    pub async fn bill_vm(&self, vm_id: i64, terminating: bool) -> PanelResult<()> {
        let vm = match self.db.get_vm(vm_id).await {
            Ok(vm) => vm,
            Err(DatabaseError::NotFound(_)) => {
                warn!(vm_id, "Billing skipped for missing VM");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let now = unix_timestamp();
        let interval = self.config.billing.billing_interval.max(1);
        let minutes = (now - vm.time_billed).max(0) / 60;
        let mut intervals = minutes / interval;

        if terminating {
            intervals += 1;
            let minimum = self.config.billing.billing_vm_minimum;
            let already = (vm.time_billed - vm.time_created).max(0) / 60 / interval;
            if already + intervals < minimum {
                intervals = minimum - already;
            }
        }

        if intervals == 0 || vm.status != VmStatus::Active {
            return Ok(());
        }

        let handle = VmHandle::load(&self.db, vm).await?;
        let vm = &handle.vm;
        let plan = &handle.plan.plan;
        let amount = intervals * plan.price;
        self.apply_charge(
            vm.user_id,
            &vm.name,
            &format!("Plan: {}", plan.name),
            &format!("vm-{}", vm.id),
            amount,
        )
        .await?;

        let billed_until = (vm.time_billed + intervals * interval * 60).min(now);
        self.db.set_vm_time_billed(vm.id, billed_until).await?;
        debug!(vm_id, intervals, amount, "VM billed");

        let driver = self.registry.get(&vm.region)?;
        match driver.bandwidth_accounting(&handle).await {
            Ok(bytes) if bytes > 0 => {
                self.db
                    .add_bandwidth_used(vm.user_id, &vm.region, bytes)
                    .await?;
            }
            Ok(_) => {}
            Err(e) => self.mail.report_error(
                &e,
                "bandwidth accounting failed",
                &format!("vm_id={}", vm.id),
            ),
        }

        Ok(())
    }

    /// Return the unused part of a VM's monthly bandwidth to the user's
    /// regional pool before the VM is deleted or moved to another plan.
    #[instrument(skip(self, vm, plan), fields(vm_id = vm.id))]
    pub async fn update_additional_bandwidth(&self, vm: &Vm, plan: &Plan) -> PanelResult<()> {
        let fraction = elapsed_month_fraction(vm.time_created, unix_timestamp());
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let bytes =
            ((fraction * plan.bandwidth as f64 + REFUND_TOLERANCE_GIB) * GIB as f64) as i64;
        self.db
            .add_bandwidth_additional(vm.user_id, &vm.region, bytes)
            .await?;
        debug!(bytes, "Bandwidth returned to pool");
        Ok(())
    }

    /// Hourly storage billing for active users' own images.
    #[instrument(skip(self))]
    pub async fn bill_services(&self) -> PanelResult<()> {
        let per_gb_hour = self.config.billing.storage_credit_per_gb_hour();
        let now = unix_timestamp();

        for user in self.db.users_due_service_billing(3600).await? {
            let hours = (now - user.time_billed) / 3600;
            if hours <= 0 {
                continue;
            }

            let mut bytes = 0;
            for image in self.db.list_owned_images(user.id).await? {
                let driver = self.registry.get(&image.region)?;
                let Some(images) = driver.images() else {
                    continue;
                };
                match images.image_info(&image.identification).await {
                    Ok(info) if info.size > 0 => bytes += info.size,
                    Ok(_) => {}
                    Err(e) => self.mail.report_error(
                        &e,
                        "image info failed during storage billing",
                        &format!("image_id={}", image.id),
                    ),
                }
            }

            let hourly = bytes * per_gb_hour / 1_000_000_000;
            if hourly > 0 {
                let total = hourly * hours;
                info!(user_id = user.id, bytes, total, "Charging image storage");
                self.apply_charge(
                    user.id,
                    "Image storage space",
                    &format!("{} MB", bytes / 1_000_000),
                    "storage",
                    total,
                )
                .await?;
            }

            self.db
                .set_user_time_billed(user.id, user.time_billed + hours * 3600)
                .await?;
        }
        Ok(())
    }

    pub async fn credit_summary(&self, user_id: i64) -> PanelResult<CreditSummary> {
        let user = self.db.get_user(user_id).await?;
        let mut hourly = 0;
        for vm in self.db.list_user_vms(user_id).await? {
            hourly += self.db.get_plan(vm.plan_id).await?.price;
        }
        let daily = hourly * 24;

        let (days_remaining, status) = if daily > 0 {
            let days = user.credit / daily;
            let status = if days < 1 {
                "danger"
            } else if days < 7 {
                "warning"
            } else {
                "success"
            };
            (days.to_string(), status)
        } else {
            ("infinite".to_string(), "success")
        };

        Ok(CreditSummary {
            credit: user.credit,
            hourly,
            daily,
            monthly: daily * 30,
            days_remaining,
            status,
        })
    }

    /// Ledger lines of one calendar month.
    pub async fn charge_list(&self, user_id: i64, year: i32, month: u32) -> PanelResult<Vec<Charge>> {
        if !(1..=12).contains(&month) {
            return Err(PanelError::validation("invalid month"));
        }
        Ok(self
            .db
            .list_charges(user_id, &format!("{year:04}-{month:02}-"))
            .await?)
    }
}
