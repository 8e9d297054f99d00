//! VM driver contract.
//!
//! A driver adapts one compute provider to the panel's VM, image and plan
//! model. Every driver implements [`VmDriver`]; optional features are
//! exposed through the capability accessors, which return `None` unless the
//! driver overrides them.

pub mod fake;
pub mod lobster;
pub mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use lobster_client::{IpAddress, VirtualMachineAction as VmAction, VirtualMachineDetails};

use crate::storage::{DatabaseError, ImageStatus, PanelDatabase, RegionalPlan, Vm};

pub use fake::FakeDriver;
pub use lobster::LobsterDriver;
pub use registry::{DriverRegistry, RegistryError};

/// Errors raised by drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Provider(String),

    #[error("operation not supported")]
    Unsupported,

    #[error("API client error: {0}")]
    Client(#[from] lobster_client::ClientError),

    #[error("VM metadata error: {0}")]
    Metadata(#[from] DatabaseError),
}

impl DriverError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }
}

/// The VM a driver call operates on: the stored row, its plan as bound in
/// the VM's region, and access to driver-scoped metadata.
#[derive(Clone)]
pub struct VmHandle {
    pub vm: Vm,
    pub plan: RegionalPlan,
    db: PanelDatabase,
}

impl VmHandle {
    pub const fn new(vm: Vm, plan: RegionalPlan, db: PanelDatabase) -> Self {
        Self { vm, plan, db }
    }

    /// Build a handle for `vm`, resolving its plan binding in the VM's region.
    pub async fn load(db: &PanelDatabase, vm: Vm) -> Result<Self, DatabaseError> {
        let plan = db.get_plan_binding(&vm.region, vm.plan_id).await?;
        Ok(Self::new(vm, plan, db.clone()))
    }

    /// Provider identification of the VM.
    pub fn identification(&self) -> &str {
        &self.vm.identification
    }

    pub async fn metadata(&self, key: &str) -> Result<Option<String>, DriverError> {
        Ok(self.db.get_vm_metadata(self.vm.id, key).await?)
    }

    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<(), DriverError> {
        Ok(self.db.set_vm_metadata(self.vm.id, key, value).await?)
    }
}

/// Live VM state reported by a driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub ip: String,
    pub private_ip: String,
    pub status: String,
    pub hostname: String,
    /// Bytes.
    pub bandwidth_used: i64,
    pub login_details: String,
    pub details: BTreeMap<String, String>,
    pub actions: Vec<VmAction>,
    pub can_vnc: bool,
    pub can_reimage: bool,
    pub can_resize: bool,
    pub can_snapshot: bool,
    pub can_addresses: bool,
    /// Keep the `can_*` flags set by the driver instead of probing.
    pub override_capabilities: bool,
}

impl From<VmInfo> for VirtualMachineDetails {
    fn from(info: VmInfo) -> Self {
        Self {
            ip: info.ip,
            private_ip: info.private_ip,
            status: info.status,
            hostname: info.hostname,
            bandwidth_used: info.bandwidth_used,
            login_details: info.login_details,
            details: info.details,
            actions: info.actions,
            can_vnc: info.can_vnc,
            can_reimage: info.can_reimage,
            can_resize: info.can_resize,
            can_snapshot: info.can_snapshot,
            can_addresses: info.can_addresses,
        }
    }
}

/// Where to send a user asking for a VM console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VncTarget {
    /// A console URL the user can open directly.
    Url(String),
    /// A raw VNC endpoint (`ip:port`) that must be exposed through websockify.
    Proxy { target: String, password: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Bytes.
    pub size: i64,
    pub status: Option<ImageStatus>,
    pub details: BTreeMap<String, String>,
}

/// An image as listed by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderImage {
    pub name: String,
    pub identification: String,
}

/// A plan as listed by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPlan {
    pub name: String,
    pub ram: i64,
    pub cpu: i64,
    pub storage: i64,
    pub bandwidth: i64,
    pub identification: String,
}

// =========================================================================
// Mandatory contract
// =========================================================================

#[async_trait]
pub trait VmDriver: Send + Sync {
    /// Create the VM and return its provider identification (never empty on
    /// success).
    async fn vm_create(
        &self,
        vm: &VmHandle,
        image_identification: &str,
    ) -> Result<String, DriverError>;

    async fn vm_delete(&self, vm: &VmHandle) -> Result<(), DriverError>;

    async fn vm_info(&self, vm: &VmHandle) -> Result<VmInfo, DriverError>;

    async fn vm_start(&self, vm: &VmHandle) -> Result<(), DriverError>;

    async fn vm_stop(&self, vm: &VmHandle) -> Result<(), DriverError>;

    async fn vm_reboot(&self, vm: &VmHandle) -> Result<(), DriverError>;

    /// Run one of the actions advertised in [`VmInfo::actions`].
    async fn vm_action(&self, vm: &VmHandle, action: &str, value: &str)
    -> Result<(), DriverError>;

    /// Bytes transferred since the previous call for this VM.
    ///
    /// The first call returns zero.
    async fn bandwidth_accounting(&self, vm: &VmHandle) -> Result<i64, DriverError>;

    fn vnc(&self) -> Option<&dyn VncCapability> {
        None
    }

    fn rename(&self) -> Option<&dyn RenameCapability> {
        None
    }

    fn reimage(&self) -> Option<&dyn ReimageCapability> {
        None
    }

    fn snapshot(&self) -> Option<&dyn SnapshotCapability> {
        None
    }

    fn resize(&self) -> Option<&dyn ResizeCapability> {
        None
    }

    fn addresses(&self) -> Option<&dyn AddressCapability> {
        None
    }

    fn images(&self) -> Option<&dyn ImageCapability> {
        None
    }

    fn plans(&self) -> Option<&dyn PlanCapability> {
        None
    }
}

// =========================================================================
// Optional capabilities
// =========================================================================

#[async_trait]
pub trait VncCapability: Send + Sync {
    async fn vm_vnc(&self, vm: &VmHandle) -> Result<VncTarget, DriverError>;
}

#[async_trait]
pub trait RenameCapability: Send + Sync {
    async fn vm_rename(&self, vm: &VmHandle, name: &str) -> Result<(), DriverError>;
}

#[async_trait]
pub trait ReimageCapability: Send + Sync {
    async fn vm_reimage(&self, vm: &VmHandle, image_identification: &str)
    -> Result<(), DriverError>;
}

#[async_trait]
pub trait SnapshotCapability: Send + Sync {
    /// Start a snapshot and return the identification of the new image.
    async fn vm_snapshot(&self, vm: &VmHandle) -> Result<String, DriverError>;
}

#[async_trait]
pub trait ResizeCapability: Send + Sync {
    async fn vm_resize(&self, vm: &VmHandle, plan: &RegionalPlan) -> Result<(), DriverError>;
}

#[async_trait]
pub trait AddressCapability: Send + Sync {
    async fn vm_addresses(&self, vm: &VmHandle) -> Result<Vec<IpAddress>, DriverError>;

    async fn vm_add_address(&self, vm: &VmHandle) -> Result<(), DriverError>;

    async fn vm_remove_address(
        &self,
        vm: &VmHandle,
        ip: &str,
        private_ip: &str,
    ) -> Result<(), DriverError>;

    async fn vm_set_rdns(&self, vm: &VmHandle, ip: &str, hostname: &str)
    -> Result<(), DriverError>;
}

#[async_trait]
pub trait ImageCapability: Send + Sync {
    /// Import an image from a URL and return its identification.
    async fn image_fetch(&self, url: &str, format: &str) -> Result<String, DriverError>;

    async fn image_info(&self, image_identification: &str) -> Result<ImageInfo, DriverError>;

    async fn image_delete(&self, image_identification: &str) -> Result<(), DriverError>;

    async fn image_list(&self) -> Result<Vec<ProviderImage>, DriverError>;
}

#[async_trait]
pub trait PlanCapability: Send + Sync {
    async fn plan_list(&self) -> Result<Vec<ProviderPlan>, DriverError>;
}

const BANDWIDTH_ANCHOR_KEY: &str = "bandwidth_anchor";

/// Turn a cumulative provider traffic counter into a per-call delta.
///
/// The last reading is kept in VM metadata. The first reading, and any
/// reading below the anchor (a counter reset), re-anchors and yields zero.
pub async fn anchored_bandwidth_delta(vm: &VmHandle, counter: i64) -> Result<i64, DriverError> {
    let previous = vm
        .metadata(BANDWIDTH_ANCHOR_KEY)
        .await?
        .and_then(|v| v.parse::<i64>().ok());
    vm.set_metadata(BANDWIDTH_ANCHOR_KEY, &counter.to_string())
        .await?;

    Ok(match previous {
        Some(previous) if counter >= previous => counter - previous,
        _ => 0,
    })
}
