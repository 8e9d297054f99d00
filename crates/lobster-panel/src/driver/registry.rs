//! Region to driver mapping, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use lobster_core::config::RegionConfig;

use super::{FakeDriver, LobsterDriver, VmDriver};
use crate::error::PanelError;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("region {0} is registered twice")]
    DuplicateRegion(String),

    #[error("region {region}: unknown driver {driver:?}")]
    UnknownDriver { region: String, driver: String },

    #[error("region {region}: {source}")]
    Client {
        region: String,
        source: lobster_client::ClientError,
    },
}

/// Immutable map from region name to its driver.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn VmDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver for `region`. Each region may be registered once.
    pub fn register(
        &mut self,
        region: &str,
        driver: Arc<dyn VmDriver>,
    ) -> Result<(), RegistryError> {
        if self.drivers.contains_key(region) {
            return Err(RegistryError::DuplicateRegion(region.to_string()));
        }
        self.drivers.insert(region.to_string(), driver);
        Ok(())
    }

    /// Build the registry from `[[region]]` configuration entries.
    pub fn from_config(regions: &[RegionConfig]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for region in regions {
            let driver: Arc<dyn VmDriver> = match region.driver.as_str() {
                "fake" => Arc::new(FakeDriver::new()),
                "lobster" => Arc::new(
                    LobsterDriver::new(&region.name, &region.url, &region.api_id, &region.api_key)
                        .map_err(|source| RegistryError::Client {
                            region: region.name.clone(),
                            source,
                        })?,
                ),
                other => {
                    return Err(RegistryError::UnknownDriver {
                        region: region.name.clone(),
                        driver: other.to_string(),
                    });
                }
            };
            registry.register(&region.name, driver)?;
            info!(region = %region.name, driver = %region.driver, "Region registered");
        }
        Ok(registry)
    }

    /// Driver for `region`.
    ///
    /// Callers only pass regions taken from stored rows or validated input,
    /// so a miss is an internal error.
    pub fn get(&self, region: &str) -> Result<Arc<dyn VmDriver>, PanelError> {
        self.drivers
            .get(region)
            .cloned()
            .ok_or_else(|| PanelError::Internal(format!("no driver registered for region {region}")))
    }

    pub fn contains(&self, region: &str) -> bool {
        self.drivers.contains_key(region)
    }

    /// Registered region names, sorted.
    pub fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self.drivers.keys().cloned().collect();
        regions.sort();
        regions
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn region(name: &str, driver: &str) -> RegionConfig {
        RegionConfig {
            name: name.to_string(),
            driver: driver.to_string(),
            url: String::new(),
            api_id: String::new(),
            api_key: String::new(),
        }
    }

    #[test]
    fn duplicate_region_is_rejected() {
        let err = DriverRegistry::from_config(&[region("r1", "fake"), region("r1", "fake")])
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::DuplicateRegion(r) if r == "r1"));
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let err = DriverRegistry::from_config(&[region("r1", "openstack")])
            .err()
            .unwrap();
        assert!(matches!(err, RegistryError::UnknownDriver { .. }));
    }

    #[test]
    fn unknown_region_is_internal_error() {
        let registry = DriverRegistry::from_config(&[region("r2", "fake"), region("r1", "fake")])
            .unwrap();
        assert_eq!(registry.regions(), vec!["r1", "r2"]);
        assert!(registry.get("r1").is_ok());
        assert!(matches!(
            registry.get("nowhere"),
            Err(PanelError::Internal(_))
        ));
    }
}
