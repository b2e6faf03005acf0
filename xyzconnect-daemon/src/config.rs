//! Daemon configuration (SPEC_FULL.md §2).
//!
//! External format is YAML rather than the teacher's TOML, per spec.md
//! §6's config contract; shape and defaulting strategy otherwise follow the
//! teacher's `Config` 1:1 — a flat sectioned struct, `#[serde(default = ..)]`
//! per field, a `Default` impl providing the whole-config fallback, and a
//! `load()`/`save()` pair that writes the defaults back out the first time
//! it runs.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub sync: SyncConfigFile,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_transfer_port_start")]
    pub transfer_port_start: u16,
    #[serde(default = "default_transfer_port_end")]
    pub transfer_port_end: u16,
    #[serde(default = "default_broadcast_interval_secs")]
    pub broadcast_interval_secs: u64,
    #[serde(default = "default_device_lost_timeout_secs")]
    pub device_lost_timeout_secs: u64,
    #[serde(default)]
    pub per_interface_broadcast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfigFile {
    #[serde(default = "default_true")]
    pub sync_contacts: bool,
    #[serde(default = "default_true")]
    pub auto_sync: bool,
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub cert_dir: PathBuf,
}

fn default_discovery_port() -> u16 {
    1716
}
fn default_transfer_port_start() -> u16 {
    1716
}
fn default_transfer_port_end() -> u16 {
    1764
}
fn default_broadcast_interval_secs() -> u64 {
    5
}
fn default_device_lost_timeout_secs() -> u64 {
    120
}
fn default_silence_timeout_secs() -> u64 {
    10
}
fn default_resync_interval_secs() -> u64 {
    300
}
fn default_pairing_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transfer_port_start: default_transfer_port_start(),
            transfer_port_end: default_transfer_port_end(),
            broadcast_interval_secs: default_broadcast_interval_secs(),
            device_lost_timeout_secs: default_device_lost_timeout_secs(),
            per_interface_broadcast: false,
        }
    }
}

impl Default for SyncConfigFile {
    fn default() -> Self {
        Self {
            sync_contacts: true,
            auto_sync: true,
            silence_timeout_secs: default_silence_timeout_secs(),
            resync_interval_secs: default_resync_interval_secs(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("xyzconnect");
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("xyzconnect");
        let cert_dir = config_dir.join("certs");

        Self {
            device: DeviceConfig {
                name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "Unknown Device".to_string()),
                device_id: None,
            },
            network: NetworkConfig::default(),
            sync: SyncConfigFile::default(),
            paths: PathConfig {
                config_dir,
                data_dir,
                cert_dir,
            },
        }
    }
}

impl Config {
    /// Load from `<config_dir>/daemon.yaml`, writing the default config out
    /// the first time there is nothing there yet.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("xyzconnect");
        let config_path = config_dir.join("daemon.yaml");

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)?;
            let config: Config = serde_yaml::from_str(&contents)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)?;
        let config_path = self.paths.config_dir.join("daemon.yaml");
        let contents = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ValidationError(format!("failed to serialize config: {e}")))?;
        fs::write(&config_path, contents)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.config_dir)?;
        fs::create_dir_all(&self.paths.data_dir)?;
        fs::create_dir_all(&self.paths.cert_dir)?;
        Ok(())
    }

    /// Reject a config whose TCP transfer range is empty or outside the
    /// KDE Connect port band, per spec.md §6.
    pub fn validate(&self) -> Result<()> {
        if self.network.transfer_port_start > self.network.transfer_port_end {
            return Err(ConfigError::ValidationError(format!(
                "transfer_port_start ({}) is greater than transfer_port_end ({})",
                self.network.transfer_port_start, self.network.transfer_port_end
            )));
        }
        if self.network.transfer_port_start < 1024 {
            return Err(ConfigError::ValidationError(format!(
                "transfer_port_start ({}) must not be a privileged port",
                self.network.transfer_port_start
            )));
        }
        Ok(())
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.paths.cert_dir.join("certificate.pem")
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.paths.cert_dir.join("privatekey.pem")
    }

    pub fn discovery_config(&self, per_interface_broadcast: bool) -> xyzconnect_protocol::DiscoveryConfig {
        xyzconnect_protocol::DiscoveryConfig {
            broadcast_interval: Duration::from_secs(self.network.broadcast_interval_secs),
            reachability_check_interval: Duration::from_secs(self.network.broadcast_interval_secs),
            device_lost_timeout: Duration::from_secs(self.network.device_lost_timeout_secs),
            per_interface_broadcast,
        }
    }

    pub fn sync_config(&self) -> xyzconnect_protocol::SyncConfig {
        xyzconnect_protocol::SyncConfig {
            silence_timeout: Duration::from_secs(self.sync.silence_timeout_secs),
            resync_interval: Duration::from_secs(self.sync.resync_interval_secs),
            sync_contacts: self.sync.sync_contacts,
            auto_sync: self.sync.auto_sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_defaults() {
        let config = Config::default();
        assert_eq!(config.network.discovery_port, 1716);
        assert_eq!(config.network.transfer_port_start, 1716);
        assert_eq!(config.network.transfer_port_end, 1764);
        assert!(config.sync.auto_sync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inverted_port_range() {
        let mut config = Config::default();
        config.network.transfer_port_start = 1764;
        config.network.transfer_port_end = 1716;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.discovery_port, config.network.discovery_port);
        assert_eq!(parsed.device.name, config.device.name);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let yaml = r#"
device:
  name: "Test Desktop"
network: {}
sync: {}
paths:
  config_dir: /tmp/xyzconnect-config
  data_dir: /tmp/xyzconnect-data
  cert_dir: /tmp/xyzconnect-certs
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.discovery_port, 1716);
        assert_eq!(config.sync.resync_interval_secs, 300);
    }
}
