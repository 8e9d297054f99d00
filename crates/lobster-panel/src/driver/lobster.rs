//! Driver backed by another lobster panel, reached through its signed API.

use async_trait::async_trait;

use lobster_client::{ApiCredentials, ClientError, LobsterClient};
use lobster_crypto::random_alphanumeric;

use super::{
    AddressCapability, DriverError, ImageCapability, ImageInfo, IpAddress, PlanCapability,
    ProviderImage, ProviderPlan, ReimageCapability, RenameCapability, ResizeCapability,
    SnapshotCapability, VmDriver, VmHandle, VmInfo, VncCapability, VncTarget,
    anchored_bandwidth_delta,
};
use crate::storage::{ImageStatus, RegionalPlan};

pub struct LobsterDriver {
    region: String,
    client: LobsterClient,
}

fn parse_id(identification: &str) -> Result<i64, DriverError> {
    identification
        .parse()
        .map_err(|_| DriverError::provider(format!("invalid remote identification {identification:?}")))
}

impl LobsterDriver {
    pub fn new(region: &str, url: &str, api_id: &str, api_key: &str) -> Result<Self, ClientError> {
        let client = LobsterClient::new(
            url,
            ApiCredentials {
                api_id: api_id.to_string(),
                api_key: api_key.to_string(),
            },
        )?;
        Ok(Self {
            region: region.to_string(),
            client,
        })
    }

    /// Remote plan ID for a local plan: the bound identification if there is
    /// one, otherwise the remote plan with the same ram, storage and cpu.
    async fn remote_plan_id(&self, plan: &RegionalPlan) -> Result<i64, DriverError> {
        if !plan.identification.is_empty() {
            return parse_id(&plan.identification);
        }
        self.client
            .plan_list()
            .await?
            .into_iter()
            .find(|p| {
                p.ram == plan.plan.ram && p.storage == plan.plan.storage && p.cpu == plan.plan.cpu
            })
            .map(|p| p.id)
            .ok_or_else(|| DriverError::provider("plan not available in this region"))
    }

    async fn remote_info(&self, vm: &VmHandle) -> Result<VmInfo, DriverError> {
        let response = self.client.vm_info(parse_id(vm.identification())?).await?;
        let details = response.details;
        Ok(VmInfo {
            ip: details.ip,
            private_ip: details.private_ip,
            status: details.status,
            hostname: details.hostname,
            bandwidth_used: details.bandwidth_used,
            login_details: details.login_details,
            details: details.details,
            actions: details.actions,
            can_vnc: details.can_vnc,
            can_reimage: details.can_reimage,
            can_resize: details.can_resize,
            can_snapshot: details.can_snapshot,
            can_addresses: details.can_addresses,
            override_capabilities: true,
        })
    }
}

#[async_trait]
impl VmDriver for LobsterDriver {
    async fn vm_create(
        &self,
        vm: &VmHandle,
        image_identification: &str,
    ) -> Result<String, DriverError> {
        let plan_id = self.remote_plan_id(&vm.plan).await?;
        let image_id = parse_id(image_identification)?;
        let id = self.client.vm_create(&vm.vm.name, plan_id, image_id).await?;
        Ok(id.to_string())
    }

    async fn vm_delete(&self, vm: &VmHandle) -> Result<(), DriverError> {
        Ok(self.client.vm_delete(parse_id(vm.identification())?).await?)
    }

    async fn vm_info(&self, vm: &VmHandle) -> Result<VmInfo, DriverError> {
        self.remote_info(vm).await
    }

    async fn vm_start(&self, vm: &VmHandle) -> Result<(), DriverError> {
        self.vm_action(vm, "start", "").await
    }

    async fn vm_stop(&self, vm: &VmHandle) -> Result<(), DriverError> {
        self.vm_action(vm, "stop", "").await
    }

    async fn vm_reboot(&self, vm: &VmHandle) -> Result<(), DriverError> {
        self.vm_action(vm, "reboot", "").await
    }

    async fn vm_action(
        &self,
        vm: &VmHandle,
        action: &str,
        value: &str,
    ) -> Result<(), DriverError> {
        Ok(self
            .client
            .vm_action(parse_id(vm.identification())?, action, value)
            .await?)
    }

    async fn bandwidth_accounting(&self, vm: &VmHandle) -> Result<i64, DriverError> {
        let info = self.remote_info(vm).await?;
        anchored_bandwidth_delta(vm, info.bandwidth_used).await
    }

    fn vnc(&self) -> Option<&dyn VncCapability> {
        Some(self)
    }

    fn rename(&self) -> Option<&dyn RenameCapability> {
        Some(self)
    }

    fn reimage(&self) -> Option<&dyn ReimageCapability> {
        Some(self)
    }

    fn snapshot(&self) -> Option<&dyn SnapshotCapability> {
        Some(self)
    }

    fn resize(&self) -> Option<&dyn ResizeCapability> {
        Some(self)
    }

    fn addresses(&self) -> Option<&dyn AddressCapability> {
        Some(self)
    }

    fn images(&self) -> Option<&dyn ImageCapability> {
        Some(self)
    }

    fn plans(&self) -> Option<&dyn PlanCapability> {
        Some(self)
    }
}

#[async_trait]
impl VncCapability for LobsterDriver {
    async fn vm_vnc(&self, vm: &VmHandle) -> Result<VncTarget, DriverError> {
        let url = self.client.vm_vnc(parse_id(vm.identification())?).await?;
        Ok(VncTarget::Url(url))
    }
}

#[async_trait]
impl RenameCapability for LobsterDriver {
    async fn vm_rename(&self, vm: &VmHandle, name: &str) -> Result<(), DriverError> {
        self.vm_action(vm, "rename", name).await
    }
}

#[async_trait]
impl ReimageCapability for LobsterDriver {
    async fn vm_reimage(
        &self,
        vm: &VmHandle,
        image_identification: &str,
    ) -> Result<(), DriverError> {
        Ok(self
            .client
            .vm_reimage(
                parse_id(vm.identification())?,
                parse_id(image_identification)?,
            )
            .await?)
    }
}

#[async_trait]
impl SnapshotCapability for LobsterDriver {
    async fn vm_snapshot(&self, vm: &VmHandle) -> Result<String, DriverError> {
        // The remote name is never shown; the local image row carries the user's name.
        let id = self
            .client
            .vm_snapshot(parse_id(vm.identification())?, &random_alphanumeric(16))
            .await?;
        Ok(id.to_string())
    }
}

#[async_trait]
impl ResizeCapability for LobsterDriver {
    async fn vm_resize(&self, vm: &VmHandle, plan: &RegionalPlan) -> Result<(), DriverError> {
        let plan_id = self.remote_plan_id(plan).await?;
        Ok(self
            .client
            .vm_resize(parse_id(vm.identification())?, plan_id)
            .await?)
    }
}

#[async_trait]
impl AddressCapability for LobsterDriver {
    async fn vm_addresses(&self, vm: &VmHandle) -> Result<Vec<IpAddress>, DriverError> {
        Ok(self.client.vm_addresses(parse_id(vm.identification())?).await?)
    }

    async fn vm_add_address(&self, vm: &VmHandle) -> Result<(), DriverError> {
        Ok(self.client.vm_address_add(parse_id(vm.identification())?).await?)
    }

    async fn vm_remove_address(
        &self,
        vm: &VmHandle,
        ip: &str,
        private_ip: &str,
    ) -> Result<(), DriverError> {
        Ok(self
            .client
            .vm_address_remove(parse_id(vm.identification())?, ip, private_ip)
            .await?)
    }

    async fn vm_set_rdns(
        &self,
        vm: &VmHandle,
        ip: &str,
        hostname: &str,
    ) -> Result<(), DriverError> {
        Ok(self
            .client
            .vm_address_rdns(parse_id(vm.identification())?, ip, hostname)
            .await?)
    }
}

#[async_trait]
impl ImageCapability for LobsterDriver {
    async fn image_fetch(&self, url: &str, format: &str) -> Result<String, DriverError> {
        let id = self
            .client
            .image_fetch(&self.region, &random_alphanumeric(16), url, format)
            .await?;
        Ok(id.to_string())
    }

    async fn image_info(&self, image_identification: &str) -> Result<ImageInfo, DriverError> {
        let response = self.client.image_info(parse_id(image_identification)?).await?;
        let details = response.details;
        let status = match details.status.as_str() {
            "pending" => Some(ImageStatus::Pending),
            "active" => Some(ImageStatus::Active),
            "error" => Some(ImageStatus::Error),
            _ => None,
        };
        Ok(ImageInfo {
            size: details.size,
            status,
            details: details.details,
        })
    }

    async fn image_delete(&self, image_identification: &str) -> Result<(), DriverError> {
        Ok(self.client.image_delete(parse_id(image_identification)?).await?)
    }

    async fn image_list(&self) -> Result<Vec<ProviderImage>, DriverError> {
        Ok(self
            .client
            .image_list()
            .await?
            .into_iter()
            .filter(|image| image.region == self.region)
            .map(|image| ProviderImage {
                name: image.name,
                identification: image.id.to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl PlanCapability for LobsterDriver {
    async fn plan_list(&self) -> Result<Vec<ProviderPlan>, DriverError> {
        Ok(self
            .client
            .plan_list()
            .await?
            .into_iter()
            .map(|plan| ProviderPlan {
                name: plan.name,
                ram: plan.ram,
                cpu: plan.cpu,
                storage: plan.storage,
                bandwidth: plan.bandwidth,
                identification: plan.id.to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_numeric_identification() {
        assert_eq!(parse_id("42").unwrap(), 42);
        assert!(matches!(parse_id("abc"), Err(DriverError::Provider(_))));
    }

    #[test]
    fn construction_requires_full_key() {
        assert!(LobsterDriver::new("r1", "https://remote.invalid/api", "id", "short").is_err());
        let key = "k".repeat(128);
        assert!(LobsterDriver::new("r1", "https://remote.invalid/api", "id", &key).is_ok());
    }
}
