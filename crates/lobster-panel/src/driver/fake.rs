//! In-process driver for development and tests.
//!
//! Counts every call, keeps its per-VM state (power, addresses) in VM
//! metadata and reports a configurable cumulative traffic counter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{
    AddressCapability, DriverError, ImageCapability, ImageInfo, IpAddress, ProviderImage,
    ReimageCapability, RenameCapability, ResizeCapability, SnapshotCapability, VmAction,
    VmDriver, VmHandle, VmInfo, VncCapability, VncTarget, anchored_bandwidth_delta,
};
use crate::storage::{ImageStatus, RegionalPlan};

const GIB: i64 = 1024 * 1024 * 1024;
const POWER_KEY: &str = "fake_power";
const ADDRESSES_KEY: &str = "fake_addresses";
const PRIVATE_IP: &str = "255.255.255.255";

/// Call counters, readable from tests.
#[derive(Debug, Default)]
pub struct FakeCounters {
    pub create: AtomicUsize,
    pub delete: AtomicUsize,
    pub info: AtomicUsize,
    pub start: AtomicUsize,
    pub stop: AtomicUsize,
    pub reboot: AtomicUsize,
    pub action: AtomicUsize,
    pub vnc: AtomicUsize,
    pub reimage: AtomicUsize,
    pub resize: AtomicUsize,
    pub snapshot: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct FakeDriver {
    pub counters: FakeCounters,
    bandwidth_counter: AtomicI64,
    fail_create: AtomicBool,
    fail_resize: AtomicBool,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cumulative traffic counter reported for every VM.
    pub fn set_bandwidth_counter(&self, bytes: i64) {
        self.bandwidth_counter.store(bytes, Ordering::SeqCst);
    }

    /// Make subsequent `vm_create` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `vm_resize` calls fail.
    pub fn set_fail_resize(&self, fail: bool) {
        self.fail_resize.store(fail, Ordering::SeqCst);
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    async fn load_addresses(vm: &VmHandle) -> Result<Vec<IpAddress>, DriverError> {
        let stored = vm.metadata(ADDRESSES_KEY).await?.unwrap_or_default();
        Ok(stored
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (ip, hostname) = entry.split_once(':').unwrap_or((entry, ""));
                IpAddress {
                    ip: ip.to_string(),
                    private_ip: PRIVATE_IP.to_string(),
                    can_rdns: true,
                    hostname: hostname.to_string(),
                }
            })
            .collect())
    }

    async fn save_addresses(vm: &VmHandle, addresses: &[IpAddress]) -> Result<(), DriverError> {
        let joined = addresses
            .iter()
            .map(|a| format!("{}:{}", a.ip, a.hostname))
            .collect::<Vec<_>>()
            .join(",");
        vm.set_metadata(ADDRESSES_KEY, &joined).await
    }
}

#[async_trait]
impl VmDriver for FakeDriver {
    async fn vm_create(
        &self,
        vm: &VmHandle,
        image_identification: &str,
    ) -> Result<String, DriverError> {
        Self::bump(&self.counters.create);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DriverError::provider("fake provider refused to create VM"));
        }
        debug!(vm_id = vm.vm.id, image = image_identification, "Fake VM created");
        vm.set_metadata(ADDRESSES_KEY, "127.0.0.1:").await?;
        vm.set_metadata(POWER_KEY, "Online").await?;
        Ok(format!("fake-{}", vm.vm.id))
    }

    async fn vm_delete(&self, _vm: &VmHandle) -> Result<(), DriverError> {
        Self::bump(&self.counters.delete);
        Ok(())
    }

    async fn vm_info(&self, vm: &VmHandle) -> Result<VmInfo, DriverError> {
        Self::bump(&self.counters.info);
        let addresses = Self::load_addresses(vm).await?;
        let status = vm
            .metadata(POWER_KEY)
            .await?
            .unwrap_or_else(|| "Online".to_string());

        let mut info = VmInfo {
            status,
            login_details: "fingerprint login supported".to_string(),
            bandwidth_used: self.bandwidth_counter.load(Ordering::SeqCst),
            actions: vec![VmAction {
                action: "rescue".to_string(),
                name: "Rescue mode".to_string(),
                description: "Boot the VM into a rescue system".to_string(),
                ..VmAction::default()
            }],
            details: BTreeMap::from([("driver".to_string(), "fake".to_string())]),
            ..VmInfo::default()
        };
        if let Some(first) = addresses.first() {
            info.ip.clone_from(&first.ip);
            info.private_ip = PRIVATE_IP.to_string();
        }
        Ok(info)
    }

    async fn vm_start(&self, vm: &VmHandle) -> Result<(), DriverError> {
        Self::bump(&self.counters.start);
        vm.set_metadata(POWER_KEY, "Online").await
    }

    async fn vm_stop(&self, vm: &VmHandle) -> Result<(), DriverError> {
        Self::bump(&self.counters.stop);
        vm.set_metadata(POWER_KEY, "Offline").await
    }

    async fn vm_reboot(&self, vm: &VmHandle) -> Result<(), DriverError> {
        Self::bump(&self.counters.reboot);
        vm.set_metadata(POWER_KEY, "Online").await
    }

    async fn vm_action(
        &self,
        _vm: &VmHandle,
        action: &str,
        _value: &str,
    ) -> Result<(), DriverError> {
        if action != "rescue" {
            return Err(DriverError::Unsupported);
        }
        Self::bump(&self.counters.action);
        Ok(())
    }

    async fn bandwidth_accounting(&self, vm: &VmHandle) -> Result<i64, DriverError> {
        anchored_bandwidth_delta(vm, self.bandwidth_counter.load(Ordering::SeqCst)).await
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
}

#[async_trait]
impl VncCapability for FakeDriver {
    async fn vm_vnc(&self, vm: &VmHandle) -> Result<VncTarget, DriverError> {
        Self::bump(&self.counters.vnc);
        Ok(VncTarget::Url(format!(
            "https://console.invalid/{}",
            vm.identification()
        )))
    }
}

#[async_trait]
impl RenameCapability for FakeDriver {
    async fn vm_rename(&self, _vm: &VmHandle, _name: &str) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl ReimageCapability for FakeDriver {
    async fn vm_reimage(
        &self,
        _vm: &VmHandle,
        _image_identification: &str,
    ) -> Result<(), DriverError> {
        Self::bump(&self.counters.reimage);
        Ok(())
    }
}

#[async_trait]
impl SnapshotCapability for FakeDriver {
    async fn vm_snapshot(&self, vm: &VmHandle) -> Result<String, DriverError> {
        let n = self.counters.snapshot.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("fake-snapshot-{}-{n}", vm.vm.id))
    }
}

#[async_trait]
impl ResizeCapability for FakeDriver {
    async fn vm_resize(&self, _vm: &VmHandle, _plan: &RegionalPlan) -> Result<(), DriverError> {
        Self::bump(&self.counters.resize);
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(DriverError::provider("fake provider refused to resize VM"));
        }
        Ok(())
    }
}

#[async_trait]
impl AddressCapability for FakeDriver {
    async fn vm_addresses(&self, vm: &VmHandle) -> Result<Vec<IpAddress>, DriverError> {
        Self::load_addresses(vm).await
    }

    async fn vm_add_address(&self, vm: &VmHandle) -> Result<(), DriverError> {
        let mut addresses = Self::load_addresses(vm).await?;
        let next = (2..=254)
            .map(|n| format!("127.0.0.{n}"))
            .find(|ip| !addresses.iter().any(|a| &a.ip == ip))
            .ok_or_else(|| DriverError::provider("no free fake addresses"))?;
        addresses.push(IpAddress {
            ip: next,
            ..IpAddress::default()
        });
        Self::save_addresses(vm, &addresses).await
    }

    async fn vm_remove_address(
        &self,
        vm: &VmHandle,
        ip: &str,
        _private_ip: &str,
    ) -> Result<(), DriverError> {
        let mut addresses = Self::load_addresses(vm).await?;
        addresses.retain(|a| a.ip != ip);
        Self::save_addresses(vm, &addresses).await
    }

    async fn vm_set_rdns(
        &self,
        vm: &VmHandle,
        ip: &str,
        hostname: &str,
    ) -> Result<(), DriverError> {
        let mut addresses = Self::load_addresses(vm).await?;
        for address in addresses.iter_mut().filter(|a| a.ip == ip) {
            address.hostname = hostname.to_string();
        }
        Self::save_addresses(vm, &addresses).await
    }
}

#[async_trait]
impl ImageCapability for FakeDriver {
    async fn image_fetch(&self, _url: &str, _format: &str) -> Result<String, DriverError> {
        Ok("fake-image".to_string())
    }

    async fn image_info(&self, _image_identification: &str) -> Result<ImageInfo, DriverError> {
        Ok(ImageInfo {
            size: GIB,
            status: Some(ImageStatus::Active),
            details: BTreeMap::new(),
        })
    }

    async fn image_delete(&self, _image_identification: &str) -> Result<(), DriverError> {
        Ok(())
    }

    async fn image_list(&self) -> Result<Vec<ProviderImage>, DriverError> {
        Ok(vec![ProviderImage {
            name: "Fake Linux".to_string(),
            identification: "fake-linux".to_string(),
        }])
    }
}
