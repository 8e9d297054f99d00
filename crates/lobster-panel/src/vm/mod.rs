//! VM lifecycle orchestration.
//!
//! [`VmService`] owns every state transition of a VM row: it validates
//! requests, gates operations on the VM's state, calls the region's driver
//! and keeps billing in step with provisioning, resizing and deletion.
//! Slow provider work (creation, deletion, suspension checks) runs in
//! spawned tasks that report their own failures.

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};

use lobster_core::config::Config;
use lobster_core::db::unix_timestamp;
use lobster_core::text::{is_printable, title_case};
use lobster_core::BILLING_PRECISION;

use crate::billing::Billing;
use crate::driver::{DriverRegistry, IpAddress, VmDriver, VmHandle, VmInfo, VncTarget};
use crate::error::{PanelError, PanelResult};
use crate::mail::{MailService, MailTemplate};
use crate::storage::{
    DatabaseError, ImageParams, ImageStatus, PanelDatabase, RegionalPlan, Suspension, Vm,
    VmParams, VmStatus,
};
use crate::websockify::Websockify;

/// Credit a user needs before creating VMs or importing images.
pub const MINIMUM_CREDIT: i64 = BILLING_PRECISION;
pub const MAX_VM_NAME_LENGTH: usize = 64;

/// Check a VM, snapshot or image name.
pub fn validate_name(name: &str) -> PanelResult<()> {
    if name.is_empty() {
        Err(PanelError::validation("name cannot be empty"))
    } else if name.len() > MAX_VM_NAME_LENGTH {
        Err(PanelError::validation(format!(
            "name cannot exceed {MAX_VM_NAME_LENGTH} characters"
        )))
    } else if !is_printable(name) {
        Err(PanelError::validation(
            "provided name contains invalid characters",
        ))
    } else {
        Ok(())
    }
}

/// Map a missing row to a validation error with `message`.
fn or_invalid<T>(result: Result<T, DatabaseError>, message: &str) -> PanelResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(DatabaseError::NotFound(_)) => Err(PanelError::validation(message)),
        Err(e) => Err(e.into()),
    }
}

/// Gate an operation on the VM's state.
///
/// Stop passes `allow_suspended` so suspended VMs can still be powered off.
pub fn ensure_operable(vm: &Vm, allow_suspended: bool) -> PanelResult<()> {
    if vm.status != VmStatus::Active || vm.identification.is_empty() {
        return Err(PanelError::VmNotReady);
    }
    if !allow_suspended {
        match vm.suspended {
            Suspension::No => {}
            Suspension::Auto => return Err(PanelError::VmSuspendedAuto),
            Suspension::Manual => return Err(PanelError::VmSuspendedManual),
        }
    }
    if vm.task_pending {
        return Err(PanelError::VmTaskPending);
    }
    Ok(())
}

#[derive(Clone)]
pub struct VmService {
    db: PanelDatabase,
    registry: Arc<DriverRegistry>,
    billing: Billing,
    mail: MailService,
    config: Arc<Config>,
    websockify: Arc<Websockify>,
}

impl VmService {
    pub const fn new(
        db: PanelDatabase,
        registry: Arc<DriverRegistry>,
        billing: Billing,
        mail: MailService,
        config: Arc<Config>,
        websockify: Arc<Websockify>,
    ) -> Self {
        Self {
            db,
            registry,
            billing,
            mail,
            config,
            websockify,
        }
    }

    async fn driver_for(&self, vm: Vm) -> PanelResult<(Arc<dyn VmDriver>, VmHandle)> {
        let driver = self.registry.get(&vm.region)?;
        let handle = VmHandle::load(&self.db, vm).await?;
        Ok((driver, handle))
    }

    /// A user's VM, or `NotFound` if it does not exist or belongs to
    /// someone else.
    pub async fn get(&self, user_id: i64, vm_id: i64) -> PanelResult<Vm> {
        Ok(self.db.get_user_vm(vm_id, user_id).await?)
    }

    pub async fn list(&self, user_id: i64) -> PanelResult<Vec<Vm>> {
        Ok(self.db.list_user_vms(user_id).await?)
    }

    pub async fn metadata(&self, vm_id: i64, key: &str) -> PanelResult<Option<String>> {
        Ok(self.db.get_vm_metadata(vm_id, key).await?)
    }

    pub async fn set_metadata(&self, vm_id: i64, key: &str, value: &str) -> PanelResult<()> {
        Ok(self.db.set_vm_metadata(vm_id, key, value).await?)
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Validate and record a new VM, then provision it in the background.
    ///
    /// Returns the VM ID as soon as the row exists; the outcome of
    /// provisioning is mailed to the user.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        user_id: i64,
        name: &str,
        plan_id: i64,
        image_id: i64,
    ) -> PanelResult<i64> {
        let user = or_invalid(self.db.get_user(user_id).await, "invalid user account")?;
        if user.credit < MINIMUM_CREDIT {
            return Err(PanelError::InsufficientCredit);
        }
        if self.db.count_user_vms(user_id).await? >= user.vm_limit {
            return Err(PanelError::validation(
                "you have exceeded your current VM count limit, please contact support to have your limit increased",
            ));
        }
        validate_name(name)?;

        let image = or_invalid(
            self.db.get_visible_image(image_id, user_id).await,
            "specified image does not exist",
        )?;
        if image.status != ImageStatus::Active {
            return Err(PanelError::validation("specified image is not ready"));
        }

        let plan = or_invalid(
            self.db.get_region_plan(&image.region, plan_id).await,
            "no such plan",
        )?;

        let region_enabled = match self.db.get_region(&image.region).await {
            Ok(region) => region.enabled,
            Err(DatabaseError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if !region_enabled || !self.registry.contains(&image.region) {
            return Err(PanelError::validation("region is not available"));
        }

        let vm = self
            .db
            .insert_vm(&VmParams {
                user_id,
                region: &image.region,
                plan_id,
                name,
            })
            .await?;
        let vm_id = vm.id;
        info!(vm_id, region = %image.region, plan_id, "VM provisioning started");

        let service = self.clone();
        tokio::spawn(async move {
            service.provision(vm, plan, image.identification).await;
        });

        Ok(vm_id)
    }

    async fn provision(&self, vm: Vm, plan: RegionalPlan, image_identification: String) {
        let vm_id = vm.id;
        let user_id = vm.user_id;
        let name = vm.name.clone();
        let detail = format!(
            "vm_id={vm_id}, name={name}, plan_id={}, image_identification={image_identification}",
            plan.plan.id
        );

        let result = match self.registry.get(&vm.region) {
            Ok(driver) => {
                let handle = VmHandle::new(vm, plan, self.db.clone());
                driver
                    .vm_create(&handle, &image_identification)
                    .await
                    .map_err(PanelError::from)
            }
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok(identification) if !identification.is_empty() => self
                .db
                .set_vm_active(vm_id, &identification)
                .await
                .map_err(PanelError::from),
            Ok(_) => Err(PanelError::Internal(
                "driver returned an empty identification".to_string(),
            )),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                info!(vm_id, "VM provisioned");
                self.mail.send(
                    Some(user_id),
                    MailTemplate::VmCreate,
                    json!({"id": vm_id, "name": name}),
                    true,
                );
            }
            Err(e) => {
                self.mail.report_error(&e, "vm creation failed", &detail);
                if let Err(e) = self.db.set_vm_status(vm_id, VmStatus::Error).await {
                    self.mail
                        .report_error(&e, "failed to mark VM as errored", &detail);
                }
                self.mail.send(
                    Some(user_id),
                    MailTemplate::VmCreateError,
                    json!({"id": vm_id, "name": name}),
                    true,
                );
            }
        }
    }

    /// Live details of a VM, with placeholders while it is not provisioned.
    ///
    /// Provider failures are reported and yield an empty record rather
    /// than an error, so listings keep rendering.
    pub async fn load_info(&self, vm: &Vm) -> PanelResult<VmInfo> {
        if vm.status != VmStatus::Active || vm.identification.is_empty() {
            return Ok(VmInfo {
                ip: "Pending".to_string(),
                private_ip: "Pending".to_string(),
                status: title_case(vm.status.as_str()),
                hostname: vm.name.clone(),
                ..VmInfo::default()
            });
        }

        let (driver, handle) = self.driver_for(vm.clone()).await?;
        let mut info = match driver.vm_info(&handle).await {
            Ok(info) => info,
            Err(e) => {
                self.mail.report_error(
                    &e,
                    "vmInfo failed",
                    &format!("vm_id={}, identification={}", vm.id, vm.identification),
                );
                VmInfo::default()
            }
        };

        if info.hostname.is_empty() {
            info.hostname.clone_from(&vm.name);
        }
        if info.ip.is_empty() {
            info.ip = "Pending".to_string();
            if info.private_ip.is_empty() {
                info.private_ip = "Pending".to_string();
            }
        } else if info.ip != vm.external_ip || info.private_ip != vm.private_ip {
            self.db
                .set_vm_ips(vm.id, &info.ip, &info.private_ip)
                .await?;
        }
        if info.status.is_empty() {
            info.status = "Unknown".to_string();
        }

        if !info.override_capabilities {
            info.can_vnc = driver.vnc().is_some();
            info.can_reimage = driver.reimage().is_some();
            info.can_resize = driver.resize().is_some();
            info.can_snapshot = driver.snapshot().is_some();
            info.can_addresses = driver.addresses().is_some();
        }
        Ok(info)
    }

    // =========================================================================
    // Power and actions
    // =========================================================================

    pub async fn start(&self, user_id: i64, vm_id: i64) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        self.start_vm(vm).await
    }

    async fn start_vm(&self, vm: Vm) -> PanelResult<()> {
        ensure_operable(&vm, false)?;
        info!(vm_id = vm.id, "Starting VM");
        let (driver, handle) = self.driver_for(vm).await?;
        Ok(driver.vm_start(&handle).await?)
    }

    /// Power off. Allowed while suspended.
    pub async fn stop(&self, user_id: i64, vm_id: i64) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        self.stop_vm(vm).await
    }

    async fn stop_vm(&self, vm: Vm) -> PanelResult<()> {
        ensure_operable(&vm, true)?;
        info!(vm_id = vm.id, "Stopping VM");
        let (driver, handle) = self.driver_for(vm).await?;
        Ok(driver.vm_stop(&handle).await?)
    }

    pub async fn reboot(&self, user_id: i64, vm_id: i64) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        info!(vm_id, "Rebooting VM");
        let (driver, handle) = self.driver_for(vm).await?;
        Ok(driver.vm_reboot(&handle).await?)
    }

    /// Run a driver-specific action advertised in the VM's details.
    pub async fn action(
        &self,
        user_id: i64,
        vm_id: i64,
        action: &str,
        value: &str,
    ) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        info!(vm_id, action, "Running VM action");
        let (driver, handle) = self.driver_for(vm).await?;
        Ok(driver.vm_action(&handle, action, value).await?)
    }

    /// Console URL for the VM. Raw VNC endpoints are exposed through the
    /// websockify bridge.
    pub async fn vnc(&self, user_id: i64, vm_id: i64) -> PanelResult<String> {
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        let (driver, handle) = self.driver_for(vm).await?;
        let vnc = driver.vnc().ok_or(PanelError::Unsupported)?;

        match vnc.vm_vnc(&handle).await {
            Ok(VncTarget::Url(url)) => Ok(url),
            Ok(VncTarget::Proxy { target, password }) => {
                Ok(self.websockify.console_url(&target, &password))
            }
            Err(e) => {
                self.mail.report_error(
                    &e,
                    "failed to retrieve VNC URL",
                    &format!("vm_id={vm_id}, identification={}", handle.identification()),
                );
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Disk and plan changes
    // =========================================================================

    /// Reinstall the VM from an active image in the same region.
    pub async fn reimage(&self, user_id: i64, vm_id: i64, image_id: i64) -> PanelResult<()> {
        let image = or_invalid(
            self.db.get_visible_image(image_id, user_id).await,
            "specified image does not exist",
        )?;
        if image.status != ImageStatus::Active {
            return Err(PanelError::validation("specified image is not ready"));
        }

        let vm = self.get(user_id, vm_id).await?;
        if image.region != vm.region {
            return Err(PanelError::validation(
                "specified image is not available in this VM's region",
            ));
        }
        ensure_operable(&vm, false)?;

        let (driver, handle) = self.driver_for(vm).await?;
        let reimage = driver.reimage().ok_or(PanelError::Unsupported)?;
        info!(vm_id, image_id, "Reimaging VM");
        Ok(reimage.vm_reimage(&handle, &image.identification).await?)
    }

    /// Snapshot the VM into a new pending image owned by the VM's owner.
    pub async fn snapshot(&self, user_id: i64, vm_id: i64, name: &str) -> PanelResult<i64> {
        if name.is_empty() {
            return Err(PanelError::validation("snapshot name cannot be empty"));
        }
        validate_name(name)?;

        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        let (driver, handle) = self.driver_for(vm).await?;
        let snapshot = driver.snapshot().ok_or(PanelError::Unsupported)?;

        let identification = snapshot.vm_snapshot(&handle).await?;
        let image = self
            .db
            .insert_image(&ImageParams {
                user_id: Some(handle.vm.user_id),
                region: &handle.vm.region,
                name,
                identification: &identification,
                status: ImageStatus::Pending,
                source_vm: Some(vm_id),
            })
            .await?;
        info!(vm_id, image_id = image.id, "Snapshot started");
        Ok(image.id)
    }

    /// Move the VM to another plan available in its region.
    ///
    /// Once the provider has resized the VM, the time already used on the
    /// old plan is billed and its unused bandwidth returned to the pool; the
    /// new plan's bandwidth is then prorated from now. A failed provider
    /// resize leaves the VM on its old plan.
    #[instrument(skip(self))]
    pub async fn resize(&self, user_id: i64, vm_id: i64, plan_id: i64) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        let new_plan = or_invalid(
            self.db.get_region_plan(&vm.region, plan_id).await,
            "no such plan",
        )?;

        let (driver, handle) = self.driver_for(vm).await?;
        let resize = driver.resize().ok_or(PanelError::Unsupported)?;

        info!(vm_id, plan_id, "Resizing VM");
        resize.vm_resize(&handle, &new_plan).await?;

        self.billing.bill_vm(vm_id, false).await?;
        self.billing
            .update_additional_bandwidth(&handle.vm, &handle.plan.plan)
            .await?;
        self.db.set_vm_plan(vm_id, plan_id, unix_timestamp()).await?;
        Ok(())
    }

    /// Rename the VM. The provider is told on a best-effort basis.
    pub async fn rename(&self, user_id: i64, vm_id: i64, name: &str) -> PanelResult<()> {
        validate_name(name)?;
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;

        self.db.rename_vm(vm_id, name).await?;
        let (driver, handle) = self.driver_for(vm).await?;
        if let Some(rename) = driver.rename() {
            if let Err(e) = rename.vm_rename(&handle, name).await {
                self.mail.report_error(
                    &e,
                    "VM rename failed",
                    &format!(
                        "vm_id={vm_id}, identification={}, name={name}",
                        handle.identification()
                    ),
                );
            }
        }
        Ok(())
    }

    // =========================================================================
    // Addresses
    // =========================================================================

    pub async fn addresses(&self, user_id: i64, vm_id: i64) -> PanelResult<Vec<IpAddress>> {
        let vm = self.get(user_id, vm_id).await?;
        if vm.status != VmStatus::Active || vm.identification.is_empty() {
            return Err(PanelError::VmNotReady);
        }
        let (driver, handle) = self.driver_for(vm).await?;
        let addresses = driver.addresses().ok_or(PanelError::Unsupported)?;
        Ok(addresses.vm_addresses(&handle).await?)
    }

    pub async fn add_address(&self, user_id: i64, vm_id: i64) -> PanelResult<()> {
        let maximum = self.config.vm.maximum_ips;
        if maximum <= 0 {
            return Err(PanelError::validation("IP address management is disabled"));
        }
        let current = self.addresses(user_id, vm_id).await?;
        if i64::try_from(current.len()).unwrap_or(i64::MAX) >= maximum {
            return Err(PanelError::validation(format!(
                "this VM already has the maximum of {maximum} IP addresses"
            )));
        }

        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        let (driver, handle) = self.driver_for(vm).await?;
        let addresses = driver.addresses().ok_or(PanelError::Unsupported)?;
        info!(vm_id, "Adding IP address");
        Ok(addresses.vm_add_address(&handle).await?)
    }

    /// Remove an address. The last remaining address cannot be removed.
    pub async fn remove_address(
        &self,
        user_id: i64,
        vm_id: i64,
        ip: &str,
        private_ip: &str,
    ) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        let (driver, handle) = self.driver_for(vm).await?;
        let addresses = driver.addresses().ok_or(PanelError::Unsupported)?;

        let current = addresses.vm_addresses(&handle).await?;
        if !current.iter().any(|a| a.ip == ip) {
            return Err(PanelError::validation("no such IP address"));
        }
        if current.len() <= 1 {
            return Err(PanelError::validation(
                "cannot remove the only IP address of a VM",
            ));
        }
        info!(vm_id, ip, "Removing IP address");
        Ok(addresses.vm_remove_address(&handle, ip, private_ip).await?)
    }

    pub async fn set_rdns(
        &self,
        user_id: i64,
        vm_id: i64,
        ip: &str,
        hostname: &str,
    ) -> PanelResult<()> {
        if hostname.len() > 255 || !is_printable(hostname) {
            return Err(PanelError::validation("invalid hostname"));
        }
        let vm = self.get(user_id, vm_id).await?;
        ensure_operable(&vm, false)?;
        let (driver, handle) = self.driver_for(vm).await?;
        let addresses = driver.addresses().ok_or(PanelError::Unsupported)?;
        Ok(addresses.vm_set_rdns(&handle, ip, hostname).await?)
    }

    // =========================================================================
    // Deletion and suspension
    // =========================================================================

    /// Delete a VM: final billing, bandwidth returned to the pool, row
    /// removed. The provider-side deletion runs in the background. Billing
    /// failures are reported and do not keep the row.
    #[instrument(skip(self))]
    pub async fn delete(&self, user_id: i64, vm_id: i64) -> PanelResult<()> {
        let vm = self.get(user_id, vm_id).await?;
        if vm.status == VmStatus::Provisioning {
            return Err(PanelError::VmNotReady);
        }

        let (driver, handle) = self.driver_for(vm).await?;
        if !handle.vm.identification.is_empty() {
            let mail = self.mail.clone();
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(e) = driver.vm_delete(&handle).await {
                    mail.report_error(
                        &e,
                        "failed to delete VM",
                        &format!(
                            "vm_id={}, identification={}",
                            handle.vm.id,
                            handle.identification()
                        ),
                    );
                }
            });
        }

        // The provider deletion is already under way; the row goes regardless.
        if let Err(e) = self.billing.bill_vm(vm_id, true).await {
            self.mail.report_error(
                &e,
                "final billing failed for deleted VM",
                &format!("vm_id={vm_id}"),
            );
        }
        if let Err(e) = self
            .billing
            .update_additional_bandwidth(&handle.vm, &handle.plan.plan)
            .await
        {
            self.mail.report_error(
                &e,
                "bandwidth refund failed for deleted VM",
                &format!("vm_id={vm_id}"),
            );
        }
        if !self.db.delete_vm(vm_id).await? {
            info!(vm_id, "VM already deleted");
        }

        info!(vm_id, user_id, "VM deleted");
        self.mail.send(
            Some(user_id),
            MailTemplate::VmDeleted,
            json!({"id": vm_id, "name": handle.vm.name}),
            true,
        );
        Ok(())
    }

    /// Suspend a VM and power it off in the background.
    ///
    /// An automatic suspension never overrides an existing one; a manual
    /// suspension always applies.
    #[instrument(skip(self))]
    pub async fn suspend(&self, vm_id: i64, mode: Suspension) -> PanelResult<()> {
        let vm = self.db.get_vm(vm_id).await?;
        match mode {
            Suspension::Auto => {
                if !self.db.auto_suspend_vm(vm_id).await? {
                    info!(vm_id, "VM already suspended");
                    return Ok(());
                }
            }
            Suspension::Manual => self.db.set_vm_suspended(vm_id, Suspension::Manual).await?,
            Suspension::No => return Err(PanelError::validation("invalid suspension mode")),
        }

        if vm.status != VmStatus::Active || vm.identification.is_empty() {
            return Ok(());
        }

        let service = self.clone();
        let delay = Duration::from_secs(self.config.vm.suspend_verify_delay_secs);
        tokio::spawn(async move {
            service.power_off_suspended(vm, delay).await;
        });
        Ok(())
    }

    async fn power_off_suspended(&self, vm: Vm, delay: Duration) {
        let vm_id = vm.id;
        let detail = format!("vm_id={vm_id}, identification={}", vm.identification);
        if let Err(e) = self.stop_vm(vm).await {
            self.mail
                .report_error(&e, "failed to stop suspended VM", &detail);
            return;
        }

        tokio::time::sleep(delay).await;
        let status = match self.db.get_vm(vm_id).await {
            Ok(vm) => self.load_info(&vm).await.map(|info| info.status),
            Err(e) => Err(e.into()),
        };
        match status {
            Ok(status) if status == "Offline" => info!(vm_id, "Suspended VM is offline"),
            Ok(status) => {
                warn!(vm_id, status = %status, "Suspended VM still running");
                self.mail.report_error(
                    &format!("status is {status}"),
                    "suspended VM did not power off",
                    &detail,
                );
            }
            Err(e) => self
                .mail
                .report_error(&e, "failed to verify suspended VM", &detail),
        }
    }

    /// Lift a suspension and start the VM.
    #[instrument(skip(self))]
    pub async fn unsuspend(&self, vm_id: i64) -> PanelResult<()> {
        self.db.set_vm_suspended(vm_id, Suspension::No).await?;
        let vm = self.db.get_vm(vm_id).await?;
        self.start_vm(vm).await
    }
}
