//! Configuration for the lobster panel.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. TOML config file (`lobster.toml` unless overridden)
//! 3. Environment variables (`LOBSTER_*`)
//!
//! After loading, [`Config::validate`] normalizes out-of-range values and
//! logs a warning for settings that are probably mistakes.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::BILLING_PRECISION;
use crate::error::{Error, Result};

/// Complete lobster configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub default: DefaultConfig,
    pub vm: VmConfig,
    pub billing: BillingConfig,
    pub billing_notifications: BillingNotificationsConfig,
    pub billing_termination: BillingTerminationConfig,
    pub session: SessionConfig,
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub email: EmailConfig,
    pub novnc: NovncConfig,
    #[serde(rename = "payment")]
    pub payments: Vec<PaymentConfig>,
    #[serde(rename = "region")]
    pub regions: Vec<RegionConfig>,
}

/// General site settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultConfig {
    /// Public base URL, used in links sent by e-mail.
    pub url_base: String,
    pub admin_email: String,
    pub from_email: String,
    /// Header carrying the client IP when running behind a reverse proxy
    /// (e.g. `X-Forwarded-For`). Empty means use the socket address.
    pub proxy_header: String,
    pub debug: bool,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            url_base: "http://localhost:8080".to_string(),
            admin_email: "admin@localhost".to_string(),
            from_email: "lobster@localhost".to_string(),
            proxy_header: String::new(),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum addresses per VM; zero or less disables adding addresses.
    pub maximum_ips: i64,
    /// VM limit given to newly registered users.
    pub default_vm_limit: i64,
    /// Seconds to wait after stopping a suspended VM before verifying it.
    pub suspend_verify_delay_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            maximum_ips: 4,
            default_vm_limit: 10,
            suspend_verify_delay_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// Overage fee per GB, in currency units.
    pub bandwidth_overage_fee: f64,
    /// Storage fee per GB-hour, in currency units.
    pub storage_fee: f64,
    pub currency: String,
    /// VM billing interval in minutes.
    pub billing_interval: i64,
    /// Minimum number of intervals billed over a VM's lifetime.
    pub billing_vm_minimum: i64,
    pub deposit_minimum: f64,
    pub deposit_maximum: f64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            bandwidth_overage_fee: 0.003,
            storage_fee: 0.000_1,
            currency: "USD".to_string(),
            billing_interval: 60,
            billing_vm_minimum: 1,
            deposit_minimum: 5.0,
            deposit_maximum: 200.0,
        }
    }
}

impl BillingConfig {
    /// Overage fee per GB, in credit units.
    #[allow(clippy::cast_possible_truncation)]
    pub fn overage_credit_per_gb(&self) -> i64 {
        (self.bandwidth_overage_fee * BILLING_PRECISION as f64).round() as i64
    }

    /// Storage fee per GB-hour, in credit units.
    #[allow(clippy::cast_possible_truncation)]
    pub fn storage_credit_per_gb_hour(&self) -> i64 {
        (self.storage_fee * BILLING_PRECISION as f64).round() as i64
    }

    /// Inclusive deposit range in credit units.
    #[allow(clippy::cast_possible_truncation)]
    pub fn deposit_range(&self) -> (i64, i64) {
        (
            (self.deposit_minimum * BILLING_PRECISION as f64).round() as i64,
            (self.deposit_maximum * BILLING_PRECISION as f64).round() as i64,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingNotificationsConfig {
    /// Hours between low-credit sweeps of a user.
    pub frequency: i64,
}

impl Default for BillingNotificationsConfig {
    fn default() -> Self {
        Self { frequency: 24 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingTerminationConfig {
    /// When false, delinquent users are suspended but never terminated.
    pub enabled: bool,
    /// Days of runway debt after which VMs are terminated.
    pub days: i64,
}

impl Default for BillingTerminationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionConfig {
    pub domain: String,
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `SQLite` file; defaults to `~/.lobster/lobster.db`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EmailConfig {
    /// Mail relay endpoint. Messages are only logged when unset.
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NovncConfig {
    /// Console URL template with `TOKEN` and `PASSWORD` placeholders.
    pub url: String,
    /// Address of the websockify listener; empty disables it.
    pub listen: String,
}

impl Default for NovncConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6080/vnc.html?token=TOKEN&password=PASSWORD".to_string(),
            listen: "127.0.0.1:6080".to_string(),
        }
    }
}

/// A payment method offered on the billing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    pub name: String,
    /// `fake` credits immediately; `redirect` sends the user to `url`.
    pub kind: String,
    /// Redirect template with `{USER_ID}` and `{AMOUNT}` placeholders.
    #[serde(default)]
    pub url: String,
}

/// A region served by a VM driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Driver kind: `fake` or `lobster`.
    pub driver: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_id: String,
    #[serde(default)]
    pub api_key: String,
}

impl Config {
    /// Normalize out-of-range settings, warning about each one.
    pub fn validate(&mut self) {
        if self.billing.currency.len() != 3 {
            warn!(currency = %self.billing.currency, "Billing currency is not a three-letter code");
        }
        if self.billing.bandwidth_overage_fee == 0.0 {
            warn!("Bandwidth overage fee is zero, bandwidth overage will not be billed");
        }
        if self.billing.storage_fee == 0.0 {
            warn!("Storage fee is zero, image storage will not be billed");
        }
        if self.billing.billing_interval <= 0 {
            warn!(
                interval = self.billing.billing_interval,
                "Invalid billing interval, using 60 minutes"
            );
            self.billing.billing_interval = 60;
        }
        if self.billing.billing_vm_minimum < 1 {
            warn!(
                minimum = self.billing.billing_vm_minimum,
                "Invalid VM billing minimum, using 1"
            );
            self.billing.billing_vm_minimum = 1;
        }
        if self.billing.deposit_minimum > self.billing.deposit_maximum {
            warn!("Deposit minimum exceeds deposit maximum");
        }
        if self.billing_notifications.frequency <= 0 {
            self.billing_notifications.frequency = 24;
        }
        if self.default.admin_email.is_empty() {
            warn!("No admin e-mail configured, error reports will only be logged");
        }
    }

    /// Database path, falling back to `~/.lobster/lobster.db`.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database
            .path
            .clone()
            .or_else(|| default_home().map(|h| h.join("lobster.db")))
    }
}

/// Load configuration from an optional TOML file and the environment.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) if path.exists() => load_config_file(path)?,
        Some(path) => {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        None => Config::default(),
    };

    apply_env_overrides(&mut config);
    config.validate();

    Ok(config)
}

/// Parse configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn default_home() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".lobster"))
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("LOBSTER_HTTP_ADDR") {
        config.http.addr = val;
    }
    if let Ok(val) = std::env::var("LOBSTER_DATABASE_PATH") {
        config.database.path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("LOBSTER_URL_BASE") {
        config.default.url_base = val;
    }
    if let Ok(val) = std::env::var("LOBSTER_ADMIN_EMAIL") {
        config.default.admin_email = val;
    }
    if let Ok(val) = std::env::var("LOBSTER_EMAIL_WEBHOOK") {
        config.email.webhook_url = Some(val);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_billing_interval_is_hourly() {
        let config = Config::default();
        assert_eq!(config.billing.billing_interval, 60);
        assert_eq!(config.billing_notifications.frequency, 24);
    }

    #[test]
    fn validate_repairs_interval_and_minimum() {
        let mut config = Config::default();
        config.billing.billing_interval = 0;
        config.billing.billing_vm_minimum = -3;
        config.validate();
        assert_eq!(config.billing.billing_interval, 60);
        assert_eq!(config.billing.billing_vm_minimum, 1);
    }

    #[test]
    fn fees_convert_to_credit_units() {
        let billing = BillingConfig {
            bandwidth_overage_fee: 0.003,
            storage_fee: 0.25,
            deposit_minimum: 5.0,
            deposit_maximum: 100.5,
            ..BillingConfig::default()
        };
        assert_eq!(billing.overage_credit_per_gb(), 3_000);
        assert_eq!(billing.storage_credit_per_gb_hour(), 250_000);
        assert_eq!(billing.deposit_range(), (5_000_000, 100_500_000));
    }

    #[test]
    fn parse_sections_and_regions() {
        let config = parse_config(
            r#"
            [default]
            url_base = "https://panel.example.com"
            admin_email = "ops@example.com"

            [billing]
            currency = "CAD"
            billing_interval = 30

            [[region]]
            name = "toronto"
            driver = "fake"

            [[region]]
            name = "upstream"
            driver = "lobster"
            url = "https://upstream.example.com/api/"
            api_id = "abcdefghijklmnop"
            api_key = "secret"

            [[payment]]
            name = "fake"
            kind = "fake"
            "#,
        )
        .unwrap();

        assert_eq!(config.default.url_base, "https://panel.example.com");
        assert_eq!(config.billing.currency, "CAD");
        assert_eq!(config.billing.billing_interval, 30);
        // untouched sections keep their defaults
        assert_eq!(config.vm.maximum_ips, 4);
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.regions[1].driver, "lobster");
        assert_eq!(config.payments[0].kind, "fake");
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("missing.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn load_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lobster.toml");
        std::fs::write(&path, "[http]\naddr = \"0.0.0.0:9000\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(!config.http.addr.is_empty());
    }
}
