//! Monthly bandwidth allocation, overage charges and usage notices.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;
use tracing::info;

use lobster_core::db::unix_timestamp;

use super::{Billing, GIB, month_bounds};
use crate::error::PanelResult;
use crate::mail::MailTemplate;

/// Traffic is only billed or reported once a region passes this much usage.
const BILLING_THRESHOLD: i64 = 200 * GIB;
/// Usage above the allocation that is tolerated before overage is charged.
const OVERAGE_LEEWAY: i64 = 50 * GIB;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BandwidthSummary {
    pub used: i64,
    pub allocated: i64,
    pub billed: i64,
    pub notified_percent: i64,
    pub actual_percent: f64,
}

impl BandwidthSummary {
    /// Whole percent of the allocation in use. Zero allocation yields zero.
    pub const fn util_percent(&self) -> i64 {
        if self.allocated == 0 {
            0
        } else {
            100 * self.used / self.allocated
        }
    }

    /// Whether a usage notice is due at the current utilisation.
    ///
    /// Notices go out above 85%, then on every further 5 points, on
    /// crossing 100%, and again when utilisation fell (more VMs) and rises
    /// past the threshold once more. Nothing is sent after the overage
    /// notice until the monthly reset.
    pub const fn notification_due(&self) -> bool {
        if self.allocated == 0 || self.notified_percent >= 100 {
            return false;
        }
        let util = self.util_percent();
        util > 85
            && (util - self.notified_percent >= 5 || util >= 100 || util < self.notified_percent)
    }
}

impl Billing {
    /// Usage and allocation for every region the user has traffic in.
    ///
    /// A VM created before this month contributes its whole plan
    /// bandwidth; a newer one contributes the share of the month it exists
    /// for.
    pub async fn bandwidth_summary(
        &self,
        user_id: i64,
    ) -> PanelResult<BTreeMap<String, BandwidthSummary>> {
        let (month_start, month_end) = month_bounds(unix_timestamp());
        let mut summaries = BTreeMap::new();

        for row in self.db.list_region_bandwidth(user_id).await? {
            let mut summary = BandwidthSummary {
                used: row.bandwidth_used,
                allocated: row.bandwidth_additional,
                billed: row.bandwidth_billed,
                notified_percent: row.bandwidth_notified_percent,
                actual_percent: 0.0,
            };

            for vm in self.db.list_user_region_vms(user_id, &row.region).await? {
                let plan_bytes = self.db.get_plan(vm.plan_id).await?.bandwidth * GIB;
                if vm.time_created > month_start {
                    let remaining = month_end - vm.time_created;
                    if remaining > 0 {
                        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                        let share = (plan_bytes as f64 * remaining as f64
                            / (month_end - month_start) as f64)
                            as i64;
                        summary.allocated += share;
                    }
                } else {
                    summary.allocated += plan_bytes;
                }
            }

            if summary.allocated > 0 {
                #[allow(clippy::cast_precision_loss)]
                let percent = 100.0 * summary.used as f64 / summary.allocated as f64;
                summary.actual_percent = percent;
            }
            summaries.insert(row.region, summary);
        }

        Ok(summaries)
    }

    /// Charge whole-GiB overage and send usage notices for each region.
    pub(super) async fn bill_bandwidth(&self, user_id: i64) -> PanelResult<()> {
        let fee = self.config.billing.overage_credit_per_gb();

        for (region, summary) in self.bandwidth_summary(user_id).await? {
            if summary.used <= BILLING_THRESHOLD {
                continue;
            }
            let Some(row) = self.db.get_region_bandwidth(user_id, &region).await? else {
                continue;
            };

            if summary.used > summary.allocated + OVERAGE_LEEWAY {
                let gb_over = (summary.used - summary.allocated - summary.billed) / GIB;
                if gb_over > 0 {
                    info!(user_id, region = %region, gb_over, "Charging bandwidth overage");
                    self.apply_charge(
                        user_id,
                        "Bandwidth",
                        &format!(
                            "Bandwidth usage overage charge {region} ({}{:.4}/GB)",
                            currency_symbol(&self.config.billing.currency),
                            self.config.billing.bandwidth_overage_fee
                        ),
                        &format!("bw-{region}"),
                        fee * gb_over,
                    )
                    .await?;
                    self.db.add_bandwidth_billed(row.id, gb_over * GIB).await?;
                }
            }

            if summary.notification_due() {
                let util = summary.util_percent();
                self.db.set_bandwidth_notified(row.id, util).await?;
                let template = if util >= 100 {
                    MailTemplate::BandwidthOverage
                } else {
                    MailTemplate::BandwidthNotify
                };
                self.mail.send(
                    Some(user_id),
                    template,
                    json!({"util_percent": util, "region": region, "fee": fee}),
                    false,
                );
            }
        }
        Ok(())
    }
}

fn currency_symbol(currency: &str) -> &str {
    match currency {
        "USD" | "CAD" | "AUD" => "$",
        "EUR" => "\u{20ac}",
        "GBP" => "\u{a3}",
        other => other,
    }
}
