//! Account-level credit policy: payments, credit adjustments and the daily
//! low-balance sweep that warns, suspends and finally terminates.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};

use lobster_core::config::Config;
use lobster_core::db::unix_timestamp;
use lobster_crypto::random_alphanumeric;

use super::{Billing, charge_day};
use crate::error::{PanelError, PanelResult};
use crate::mail::{MailService, MailTemplate};
use crate::storage::{
    DatabaseError, LedgerEntry, PanelDatabase, Suspension, Transaction, TransactionParams,
};
use crate::vm::VmService;

/// Runway, in hours of current burn, under which a user is warned.
const LOW_CREDIT_HOURS: i64 = 7 * 24;
/// Warnings sent before a negative balance leads to suspension.
const WARNINGS_BEFORE_SUSPEND: i64 = 5;
/// Termination only follows a notice sent within this many hours.
const TERMINATION_NOTICE_HOURS: i64 = 48;

#[derive(Clone)]
pub struct AccountService {
    db: PanelDatabase,
    billing: Billing,
    vms: VmService,
    mail: MailService,
    config: Arc<Config>,
}

impl AccountService {
    pub const fn new(
        db: PanelDatabase,
        billing: Billing,
        vms: VmService,
        mail: MailService,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            billing,
            vms,
            mail,
            config,
        }
    }

    pub const fn billing(&self) -> &Billing {
        &self.billing
    }

    /// Credit a user. A `new` user becomes `active`; once the balance is
    /// positive, VMs suspended for non-payment are resumed.
    #[instrument(skip(self, detail))]
    pub async fn apply_credit(&self, user_id: i64, amount: i64, detail: &str) -> PanelResult<()> {
        let day = charge_day(unix_timestamp());
        let key = format!("credit-{}", random_alphanumeric(16));
        self.db
            .record_ledger_entry(
                &LedgerEntry {
                    user_id,
                    name: "Credit updated",
                    detail,
                    key: &key,
                    day: &day,
                    amount: -amount,
                },
                true,
            )
            .await?;
        self.resume_if_funded(user_id).await
    }

    async fn resume_if_funded(&self, user_id: i64) -> PanelResult<()> {
        let user = self.db.get_user(user_id).await?;
        if user.credit <= 0 {
            return Ok(());
        }

        for vm in self
            .db
            .list_user_suspended_vms(user_id, Suspension::Auto)
            .await?
        {
            if let Err(e) = self.vms.unsuspend(vm.id).await {
                self.mail.report_error(
                    &e,
                    "failed to unsuspend VM",
                    &format!("user_id={user_id}, vm_id={}", vm.id),
                );
            }
            self.mail.send(
                Some(user_id),
                MailTemplate::VmUnsuspend,
                json!({"name": vm.name}),
                false,
            );
        }
        Ok(())
    }

    /// Record a payment from `gateway` and credit the user.
    ///
    /// Replays of the same `(gateway, gateway_identifier)` are ignored and
    /// return `Ok(None)`. Out-of-range amounts and unknown users are
    /// reported to the operator and rejected.
    #[instrument(skip(self, notes))]
    pub async fn add_transaction(
        &self,
        user_id: i64,
        gateway: &str,
        gateway_identifier: &str,
        notes: &str,
        amount: i64,
        fee: i64,
    ) -> PanelResult<Option<Transaction>> {
        if self.db.transaction_exists(gateway, gateway_identifier).await? {
            info!(gateway, gateway_identifier, amount, "Duplicate transaction ignored");
            return Ok(None);
        }

        let detail = format!("user={user_id}, gateway={gateway}, gateway_identifier={gateway_identifier}");
        let (minimum, maximum) = self.config.billing.deposit_range();
        if amount < minimum || amount > maximum {
            let err = PanelError::validation(format!(
                "invalid payment of {} cents",
                amount * 100 / lobster_core::BILLING_PRECISION
            ));
            self.mail.report_error(&err, "transaction add error", &detail);
            return Err(err);
        }

        if let Err(e) = self.db.get_user(user_id).await {
            let err = PanelError::from(e);
            self.mail.report_error(&err, "transaction add error", &detail);
            return Err(err);
        }

        let credit_detail = format!("Transaction {gateway}/{gateway_identifier}");
        let key = format!("tx-{gateway}-{gateway_identifier}");
        let day = charge_day(unix_timestamp());
        let recorded = self
            .db
            .record_transaction(
                &TransactionParams {
                    user_id,
                    gateway,
                    gateway_identifier,
                    notes,
                    amount,
                    fee,
                },
                &LedgerEntry {
                    user_id,
                    name: "Credit updated",
                    detail: &credit_detail,
                    key: &key,
                    day: &day,
                    amount: -amount,
                },
            )
            .await?;

        let Some(transaction) = recorded else {
            info!(gateway, gateway_identifier, "Duplicate transaction ignored");
            return Ok(None);
        };

        self.resume_if_funded(user_id).await?;
        self.mail.send(
            Some(user_id),
            MailTemplate::PaymentProcessed,
            json!({
                "amount": transaction.amount,
                "fee": transaction.fee,
                "gateway": transaction.gateway,
                "gateway_identifier": transaction.gateway_identifier,
                "notes": transaction.notes,
            }),
            true,
        );
        info!(user_id, amount, gateway, gateway_identifier, "Processed payment");
        Ok(Some(transaction))
    }

    /// Bandwidth billing plus, at most once per notification period, the
    /// low-balance policy for users that own VMs.
    #[instrument(skip(self))]
    pub async fn bill_user(&self, user_id: i64) -> PanelResult<()> {
        self.billing.bill_bandwidth(user_id).await?;

        let user = self.db.get_user(user_id).await?;
        let now = unix_timestamp();
        let frequency = self.config.billing_notifications.frequency.max(1) * 3600;
        if user.last_billing_notify >= now - frequency {
            return Ok(());
        }
        let vms = self.db.list_user_vms(user_id).await?;
        if vms.is_empty() {
            return Ok(());
        }

        let hourly = self.billing.credit_summary(user_id).await?.hourly;
        let credit = user.credit;

        if credit > hourly * LOW_CREDIT_HOURS {
            self.db.set_billing_notify(user_id, now, 0).await?;
            return Ok(());
        }

        if credit < 0 && user.billing_low_count >= WARNINGS_BEFORE_SUSPEND {
            let termination = &self.config.billing_termination;
            let hours_since_notice = (now - user.last_billing_notify) / 3600;
            let terminate = termination.enabled
                && credit < -(termination.days * 24 * hourly)
                && hours_since_notice > 0
                && hours_since_notice <= TERMINATION_NOTICE_HOURS;

            if terminate {
                warn!(user_id, credit, "Terminating delinquent account");
                for vm in &vms {
                    if let Err(e) = self.vms.delete(user_id, vm.id).await {
                        self.mail.report_error(
                            &e,
                            "failed to delete VM",
                            &format!("user_id={user_id}, vm_id={}", vm.id),
                        );
                    }
                }
                self.mail
                    .send(Some(user_id), MailTemplate::UserTerminate, json!({}), false);
            } else {
                warn!(user_id, credit, "Suspending delinquent account");
                for vm in &vms {
                    if let Err(e) = self.vms.suspend(vm.id, Suspension::Auto).await {
                        self.mail.report_error(
                            &e,
                            "failed to suspend VM",
                            &format!("user_id={user_id}, vm_id={}", vm.id),
                        );
                    }
                }
                self.mail
                    .send(Some(user_id), MailTemplate::UserSuspend, json!({}), false);
            }
        } else {
            let remaining_hours = if hourly > 0 { credit / hourly } else { 0 };
            let template = if credit < 0 {
                MailTemplate::UserNegativeCredit
            } else {
                MailTemplate::UserLowCredit
            };
            self.mail.send(
                Some(user_id),
                template,
                json!({
                    "credit": credit,
                    "hourly": hourly,
                    "remaining_hours": remaining_hours,
                }),
                false,
            );
        }

        self.db
            .set_billing_notify(user_id, now, user.billing_low_count + 1)
            .await?;
        Ok(())
    }

    /// One billing pass: stale VMs, due users, then storage.
    ///
    /// A failure on one VM or user is reported and does not stop the pass.
    pub async fn billing_pass(&self) -> Result<(), DatabaseError> {
        for vm_id in self.db.vms_due_billing(3600).await? {
            if let Err(e) = self.billing.bill_vm(vm_id, false).await {
                self.mail
                    .report_error(&e, "VM billing failed", &format!("vm_id={vm_id}"));
            }
        }

        let frequency = self.config.billing_notifications.frequency.max(1) * 3600;
        for user_id in self.db.users_due_notification(frequency).await? {
            if let Err(e) = self.bill_user(user_id).await {
                self.mail
                    .report_error(&e, "user billing failed", &format!("user_id={user_id}"));
            }
        }

        if let Err(e) = self.billing.bill_services().await {
            self.mail.report_error(&e, "service billing failed", "");
        }
        Ok(())
    }
}
