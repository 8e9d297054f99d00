//! JSON bodies exchanged on the `/api` surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A virtual machine as listed by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: i64,
    pub plan_id: i64,
    pub region: String,
    pub name: String,
    pub status: String,
    pub task_pending: bool,
    pub external_ip: String,
    pub private_ip: String,
    /// Unix seconds.
    pub created_time: i64,
}

/// A provider-specific action advertised by a VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineAction {
    pub action: String,
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dangerous: bool,
}

/// Live details of a VM, as reported by its provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualMachineDetails {
    pub ip: String,
    pub private_ip: String,
    pub status: String,
    pub hostname: String,
    pub bandwidth_used: i64,
    pub login_details: String,
    pub details: BTreeMap<String, String>,
    pub actions: Vec<VirtualMachineAction>,
    pub can_vnc: bool,
    pub can_reimage: bool,
    pub can_resize: bool,
    pub can_snapshot: bool,
    pub can_addresses: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub ip: String,
    pub private_ip: String,
    pub can_rdns: bool,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub region: String,
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageDetails {
    pub size: i64,
    pub status: String,
    pub details: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    /// Credit units per hour.
    pub price: i64,
    pub ram: i64,
    pub cpu: i64,
    pub storage: i64,
    pub bandwidth: i64,
}

// =========================================================================
// Requests
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreateRequest {
    pub name: String,
    pub plan_id: i64,
    pub image_id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmActionRequest {
    pub action: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmReimageRequest {
    pub image_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResizeRequest {
    pub plan_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmAddressRemoveRequest {
    pub ip: String,
    #[serde(default)]
    pub private_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmAddressRdnsRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFetchRequest {
    pub region: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub format: String,
}

// =========================================================================
// Responses
// =========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmListResponse {
    pub vms: Vec<VirtualMachine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreateResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfoResponse {
    pub vm: VirtualMachine,
    pub details: VirtualMachineDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmVncResponse {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshotResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmAddressesResponse {
    pub addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageFetchResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfoResponse {
    pub image: Image,
    pub details: ImageDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanListResponse {
    pub plans: Vec<Plan>,
}

/// Body of every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn details_tolerate_missing_fields() {
        let details: VirtualMachineDetails =
            serde_json::from_str(r#"{"ip":"10.0.0.5","status":"Online"}"#).unwrap();
        assert_eq!(details.ip, "10.0.0.5");
        assert!(details.actions.is_empty());
        assert!(!details.can_vnc);
    }

    #[test]
    fn action_request_value_defaults_to_empty() {
        let req: VmActionRequest = serde_json::from_str(r#"{"action":"start"}"#).unwrap();
        assert_eq!(req.action, "start");
        assert_eq!(req.value, "");
    }

    #[test]
    fn list_response_uses_vms_key() {
        let json = serde_json::to_value(VmListResponse { vms: Vec::new() }).unwrap();
        assert!(json.get("vms").is_some());
    }
}
