//! Runtime settings of the daemon.
//!
//! These are deployment knobs (paths, timings, which backends to use) and
//! are distinct from the persisted [`DeviceConfig`](crate::config_store::DeviceConfig).

use crate::config_store::{DEFAULT_PROVISIONING_SECRET, DEFAULT_PROVISIONING_SSID, DeviceConfig};
use crate::connectivity::TransitionTimings;
use crate::device::{Secret, Ssid};
use crate::{Error, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings compiled into the binary.
pub const BUILTIN_SETTINGS: &str = include_str!("../node.toml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigBackendKind {
    Json,
    KeyValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WirelessBackendKind {
    Mock,
    WpaCli,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub provisioning_ssid: String,
    pub provisioning_secret: String,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            provisioning_ssid: DEFAULT_PROVISIONING_SSID.to_owned(),
            provisioning_secret: DEFAULT_PROVISIONING_SECRET.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub data_dir: PathBuf,
    pub config_backend: ConfigBackendKind,
    pub bind_addr: SocketAddr,

    // === Volume ===
    pub unmount_delay_ms: u64,
    pub lock_timeout_ms: u64,
    pub housekeeping_tick_ms: u64,

    pub event_queue_capacity: usize,

    // === Wireless ===
    pub wireless_backend: WirelessBackendKind,
    pub interface_name: String,
    pub disconnect_settle_ms: u64,
    pub shutdown_settle_ms: u64,
    pub restart_delay_ms: u64,
    pub link_poll_ms: u64,

    pub defaults: DefaultsSection,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/ntc-node"),
            config_backend: ConfigBackendKind::Json,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            unmount_delay_ms: 5_000,
            lock_timeout_ms: 10_000,
            housekeeping_tick_ms: 500,
            event_queue_capacity: crate::events::DEFAULT_QUEUE_CAPACITY,
            wireless_backend: WirelessBackendKind::Mock,
            interface_name: "wlan0".to_owned(),
            disconnect_settle_ms: 1_000,
            shutdown_settle_ms: 1_000,
            restart_delay_ms: 1_000,
            link_poll_ms: 2_000,
            defaults: DefaultsSection::default(),
        }
    }
}

impl NodeSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: NodeSettings = toml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads `path` when given, the built-in settings otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading settings file");
                Self::from_toml_str(&std::fs::read_to_string(path)?)
            }
            None => Self::from_toml_str(BUILTIN_SETTINGS),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.housekeeping_tick_ms == 0 {
            return Err(Error::InvalidSetting("housekeeping_tick_ms must be positive".into()));
        }
        if self.link_poll_ms == 0 {
            return Err(Error::InvalidSetting("link_poll_ms must be positive".into()));
        }
        if self.interface_name.trim().is_empty() {
            return Err(Error::InvalidSetting("interface_name must not be empty".into()));
        }
        Ok(())
    }

    pub fn unmount_delay(&self) -> Duration {
        Duration::from_millis(self.unmount_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn housekeeping_tick(&self) -> Duration {
        Duration::from_millis(self.housekeeping_tick_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_millis(self.link_poll_ms)
    }

    pub fn transition_timings(&self) -> TransitionTimings {
        TransitionTimings {
            disconnect_settle: Duration::from_millis(self.disconnect_settle_ms),
            shutdown_settle: Duration::from_millis(self.shutdown_settle_ms),
        }
    }

    /// Compiled-in device configuration with the `[defaults]` overrides applied.
    pub fn device_defaults(&self) -> DeviceConfig {
        DeviceConfig {
            provisioning_ssid: Ssid::new(&self.defaults.provisioning_ssid),
            provisioning_secret: Secret::new(&self.defaults.provisioning_secret),
            ..DeviceConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_settings_parse() {
        let settings = NodeSettings::load(None).unwrap();
        assert_eq!(settings.config_backend, ConfigBackendKind::Json);
        assert_eq!(settings.wireless_backend, WirelessBackendKind::WpaCli);
        assert_eq!(settings.event_queue_capacity, 10);
        assert_eq!(settings.transition_timings(), TransitionTimings::default());
    }

    #[test]
    fn test_missing_keys_use_defaults() {
        let settings = NodeSettings::from_toml_str(
            r#"
            config_backend = "key_value"
            [defaults]
            provisioning_secret = ""
            "#,
        )
        .unwrap();
        assert_eq!(settings.config_backend, ConfigBackendKind::KeyValue);
        assert_eq!(settings.interface_name, "wlan0");
        assert_eq!(settings.defaults.provisioning_ssid, DEFAULT_PROVISIONING_SSID);

        let defaults = settings.device_defaults();
        assert!(defaults.provisioning_secret.is_empty());
        assert_eq!(defaults.sensor_enable_mask, DeviceConfig::default().sensor_enable_mask);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            NodeSettings::from_toml_str("config_backend = \"flash\""),
            Err(Error::Toml(_))
        ));
        assert!(matches!(
            NodeSettings::from_toml_str("housekeeping_tick_ms = 0"),
            Err(Error::InvalidSetting(_))
        ));
    }
}
