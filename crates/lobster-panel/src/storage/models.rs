//! Data models for lobster panel storage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserStatus {
    New,
    Active,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum VmStatus {
    Provisioning,
    Active,
    Error,
}

impl VmStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

/// Why a VM is suspended, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Suspension {
    No,
    /// Negative credit; lifted automatically once the account is paid up.
    Auto,
    /// Operator action; lifted only by an operator.
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Active,
    Error,
}

impl ImageStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub credit: i64,
    pub vm_limit: i64,
    pub time_created: i64,
    pub last_billing_notify: i64,
    pub billing_low_count: i64,
    pub time_billed: i64,
    pub status: UserStatus,
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Region {
    pub region: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    /// Credit units per hour.
    pub price: i64,
    /// Megabytes.
    pub ram: i64,
    pub cpu: i64,
    /// Gigabytes.
    pub storage: i64,
    /// Gigabytes per month.
    pub bandwidth: i64,
    pub global: bool,
    pub enabled: bool,
}

/// A plan as seen from one region, with the provider identification bound
/// there (empty for global plans without a binding).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegionalPlan {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub plan: Plan,
    pub identification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegionPlan {
    pub plan_id: i64,
    pub region: String,
    pub identification: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Image {
    pub id: i64,
    /// `None` for public images.
    pub user_id: Option<i64>,
    pub region: String,
    pub name: String,
    pub identification: String,
    pub status: ImageStatus,
    pub source_vm: Option<i64>,
    pub time_created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vm {
    pub id: i64,
    pub user_id: i64,
    pub region: String,
    pub plan_id: i64,
    pub name: String,
    pub identification: String,
    pub status: VmStatus,
    pub task_pending: bool,
    pub external_ip: String,
    pub private_ip: String,
    pub time_created: i64,
    pub time_billed: i64,
    pub suspended: Suspension,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Charge {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub detail: String,
    pub k: String,
    /// `YYYY-MM-DD`.
    pub day: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub user_id: i64,
    pub gateway: String,
    pub gateway_identifier: String,
    pub notes: String,
    pub amount: i64,
    pub fee: i64,
    pub time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegionBandwidth {
    pub id: i64,
    pub user_id: i64,
    pub region: String,
    pub bandwidth_used: i64,
    pub bandwidth_additional: i64,
    pub bandwidth_billed: i64,
    pub bandwidth_notified_percent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub label: String,
    pub api_id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub nonce: i64,
    pub restrict_action: String,
    pub restrict_ip: String,
    pub time_created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub uid: String,
    /// Zero for an anonymous session.
    pub user_id: i64,
    pub admin: bool,
    pub original_id: i64,
    pub regenerate: bool,
    pub active_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionLog {
    pub id: i64,
    pub user_id: i64,
    pub ip: String,
    pub name: String,
    pub details: String,
    pub time: i64,
}
