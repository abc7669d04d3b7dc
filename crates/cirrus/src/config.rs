use cirrus_controllers::ControllerConfig;
use cirrus_platform::{Credentials, MockInventory};
use miette::{miette, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Manager settings read from the `--config` YAML file
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Namespace holding the secrets of cluster-scoped identities
    pub controller_namespace: String,
    /// Used for clusters without an identity reference
    pub default_credentials: Option<Credentials>,
    pub enable_anti_affinity: bool,
    pub workers: usize,
    pub requeue_after_secs: u64,
    pub resync_period_secs: u64,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    /// Talk to real workload API servers instead of the mock
    pub remote: Option<RemoteConfig>,
    /// Inventory served by the development platform
    pub inventory: MockInventory,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub accept_invalid_certs: bool,
    pub bearer_token: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let defaults = ControllerConfig::default();
        Self {
            controller_namespace: defaults.controller_namespace,
            default_credentials: None,
            enable_anti_affinity: defaults.enable_anti_affinity,
            workers: defaults.workers,
            requeue_after_secs: defaults.requeue_after.as_secs(),
            resync_period_secs: defaults.resync_period.as_secs(),
            poll_interval_secs: defaults.poll_interval.as_secs(),
            poll_timeout_secs: defaults.poll_timeout.as_secs(),
            remote: None,
            inventory: MockInventory::default(),
        }
    }
}

impl ManagerConfig {
    /// Read the config file, or fall back to defaults when none is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .map_err(|e| miette!("Failed to read config '{}': {}", path.display(), e))?;
        Self::parse(&data).map_err(|e| miette!("Invalid config '{}': {}", path.display(), e))
    }

    pub fn parse(data: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(data)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            enable_anti_affinity: self.enable_anti_affinity,
            controller_namespace: self.controller_namespace.clone(),
            workers: self.workers.max(1),
            requeue_after: Duration::from_secs(self.requeue_after_secs),
            resync_period: Duration::from_secs(self.resync_period_secs.max(1)),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            ..ControllerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_controller_defaults() {
        let config = ManagerConfig::default().controller_config();
        let defaults = ControllerConfig::default();
        assert_eq!(config.workers, defaults.workers);
        assert_eq!(config.resync_period, defaults.resync_period);
        assert_eq!(config.controller_namespace, "capv-system");
        assert!(!config.enable_anti_affinity);
    }

    #[test]
    fn test_parse_partial_config() {
        let config = ManagerConfig::parse(
            r#"
enableAntiAffinity: true
workers: 2
resyncPeriodSecs: 30
defaultCredentials:
  username: admin
  password: hunter2
inventory:
  version: "6.7.0"
  datacenters: [dc0, dc1]
"#,
        )
        .unwrap();

        let controller = config.controller_config();
        assert!(controller.enable_anti_affinity);
        assert_eq!(controller.workers, 2);
        assert_eq!(controller.resync_period, Duration::from_secs(30));
        assert_eq!(
            config.default_credentials,
            Some(Credentials::new("admin", "hunter2"))
        );
        assert_eq!(config.inventory.version, "6.7.0");
        assert_eq!(config.inventory.datacenters.len(), 2);
        // Unset inventory fields keep their defaults
        assert_eq!(
            config.inventory.datastores,
            MockInventory::default().datastores
        );
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_unknown_shape_is_rejected() {
        assert!(ManagerConfig::parse("workers: many").is_err());
    }
}
