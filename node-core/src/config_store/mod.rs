//! Persistent device configuration.
//!
//! Two backend generations exist: the legacy flat key-value store
//! ([`key_value::KeyValueBackend`]) and the current JSON document on the
//! mounted volume ([`json_file::JsonFileBackend`]). Exactly one is active.
//!
//! Loading never fails. Each field resolves on its own:
//! 1. a value in the backend wins, unless it is an empty string;
//! 2. a missing (or unreadable) value falls through;
//! 3. the compiled-in default fills the gap.
//!
//! Numeric fields are range-checked afterwards. Out-of-range values are
//! corrected in memory only; they reach the backend again on the next
//! explicit `save`.

pub mod json_file;
pub mod key_value;

use crate::Result;
use crate::device::{Secret, Ssid, StartupMode};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROVISIONING_SSID: &str = "ntc-node-setup";
pub const DEFAULT_PROVISIONING_SECRET: &str = "ntc-node-1234";
pub const DEFAULT_SENSOR_MASK: u8 = 0b0011_1111;
pub const DEFAULT_STARTUP_MODE: StartupMode = StartupMode::Provisioning;
pub const DEFAULT_CHANNEL: u8 = 1;
pub const CHANNEL_RANGE: std::ops::RangeInclusive<u8> = 1..=13;

/// Serializable snapshot of the persisted fields.
///
/// The serde layout is the on-disk JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub client_ssid: Ssid,
    pub client_secret: Secret,
    pub provisioning_ssid: Ssid,
    pub provisioning_secret: Secret,
    pub sensor_enable_mask: u8,
    pub startup_mode: StartupMode,
    #[serde(default = "default_channel")]
    pub provisioning_channel: u8,
}

fn default_channel() -> u8 {
    DEFAULT_CHANNEL
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_ssid: Ssid::default(),
            client_secret: Secret::default(),
            provisioning_ssid: Ssid::new(DEFAULT_PROVISIONING_SSID),
            provisioning_secret: Secret::new(DEFAULT_PROVISIONING_SECRET),
            sensor_enable_mask: DEFAULT_SENSOR_MASK,
            startup_mode: DEFAULT_STARTUP_MODE,
            provisioning_channel: DEFAULT_CHANNEL,
        }
    }
}

/// Field values as found in a backend, before defaulting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawConfig {
    pub client_ssid: Option<String>,
    pub client_secret: Option<String>,
    pub provisioning_ssid: Option<String>,
    pub provisioning_secret: Option<String>,
    pub sensor_enable_mask: Option<i64>,
    pub startup_mode: Option<i64>,
    pub provisioning_channel: Option<i64>,
}

/// A persistence backend. Calls block for the duration of the I/O.
pub trait ConfigBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reads whatever the store holds. An `Err` means the store as a whole
    /// is unavailable (missing, unreadable or corrupt).
    fn read(&self) -> Result<RawConfig>;

    fn write(&self, config: &DeviceConfig) -> Result<()>;
}

/// Outcome of a load, for callers that need to know how it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub config: DeviceConfig,
    /// False when the backend could not be read at all.
    pub backend_available: bool,
    /// Fields whose stored value failed validation and was replaced.
    pub corrected: Vec<&'static str>,
}

pub struct ConfigStore {
    backend: Box<dyn ConfigBackend>,
    defaults: DeviceConfig,
}

impl ConfigStore {
    pub fn new(backend: impl ConfigBackend + 'static, defaults: DeviceConfig) -> Self {
        Self {
            backend: Box::new(backend),
            defaults,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn defaults(&self) -> &DeviceConfig {
        &self.defaults
    }

    pub fn load(&self) -> DeviceConfig {
        self.load_report().config
    }

    pub fn load_report(&self) -> LoadReport {
        match self.backend.read() {
            Ok(raw) => {
                let (config, corrected) = resolve(raw, &self.defaults);
                LoadReport {
                    config,
                    backend_available: true,
                    corrected,
                }
            }
            Err(e) => {
                tracing::warn!(backend = self.backend.name(), "Config store unavailable, using defaults: {}", e);
                LoadReport {
                    config: self.defaults.clone(),
                    backend_available: false,
                    corrected: Vec::new(),
                }
            }
        }
    }

    pub fn save(&self, config: &DeviceConfig) -> Result<()> {
        tracing::info!(
            backend = self.backend.name(),
            client_ssid = %config.client_ssid,
            provisioning_ssid = %config.provisioning_ssid,
            mask = config.sensor_enable_mask,
            startup_mode = config.startup_mode.code(),
            "Storing running config"
        );
        self.backend.write(config).inspect_err(|e| {
            tracing::error!(backend = self.backend.name(), "Failed to store config: {}", e);
        })
    }
}

fn resolve(raw: RawConfig, defaults: &DeviceConfig) -> (DeviceConfig, Vec<&'static str>) {
    let mut corrected = Vec::new();

    let config = DeviceConfig {
        client_ssid: resolve_string("client_ssid", raw.client_ssid, &defaults.client_ssid).into(),
        client_secret: resolve_string("client_secret", raw.client_secret, &defaults.client_secret).into(),
        provisioning_ssid: resolve_string("provisioning_ssid", raw.provisioning_ssid, &defaults.provisioning_ssid)
            .into(),
        provisioning_secret: resolve_string(
            "provisioning_secret",
            raw.provisioning_secret,
            &defaults.provisioning_secret,
        )
        .into(),
        sensor_enable_mask: resolve_number(
            "sensor_enable_mask",
            raw.sensor_enable_mask,
            defaults.sensor_enable_mask,
            |v| u8::try_from(v).ok(),
            &mut corrected,
        ),
        startup_mode: resolve_number(
            "startup_mode",
            raw.startup_mode,
            defaults.startup_mode,
            |v| match StartupMode::from_code(v) {
                Some(StartupMode::Unset) | None => None,
                valid => valid,
            },
            &mut corrected,
        ),
        provisioning_channel: resolve_number(
            "provisioning_channel",
            raw.provisioning_channel,
            defaults.provisioning_channel,
            |v| u8::try_from(v).ok().filter(|c| CHANNEL_RANGE.contains(c)),
            &mut corrected,
        ),
    };

    (config, corrected)
}

fn resolve_string(field: &'static str, stored: Option<String>, default: &str) -> String {
    match stored {
        Some(value) if !value.is_empty() => {
            tracing::debug!(field, "Found stored value");
            value
        }
        Some(_) => {
            tracing::info!(field, "Stored value is empty, using default");
            default.to_owned()
        }
        None => {
            tracing::info!(field, "No stored value, using default");
            default.to_owned()
        }
    }
}

fn resolve_number<T: Copy + std::fmt::Debug>(
    field: &'static str,
    stored: Option<i64>,
    default: T,
    validate: impl FnOnce(i64) -> Option<T>,
    corrected: &mut Vec<&'static str>,
) -> T {
    let Some(raw) = stored else {
        tracing::info!(field, ?default, "No stored value, using default");
        return default;
    };
    match validate(raw) {
        Some(value) => value,
        None => {
            tracing::error!(field, raw, ?default, "Stored value out of range, correcting in memory");
            corrected.push(field);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// In-memory backend for exercising the defaulting chain.
    #[derive(Clone, Default)]
    struct MemoryBackend {
        stored: Arc<Mutex<Option<RawConfig>>>,
        writes: Arc<Mutex<usize>>,
        read_only: bool,
    }

    impl ConfigBackend for MemoryBackend {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn read(&self) -> Result<RawConfig> {
            self.stored
                .lock()
                .clone()
                .ok_or_else(|| Error::CorruptStore("empty".into()))
        }

        fn write(&self, config: &DeviceConfig) -> Result<()> {
            if self.read_only {
                return Err(Error::Io(std::io::Error::other("read-only medium")));
            }
            *self.writes.lock() += 1;
            *self.stored.lock() = Some(RawConfig {
                client_ssid: Some(config.client_ssid.to_string()),
                client_secret: Some(config.client_secret.to_string()),
                provisioning_ssid: Some(config.provisioning_ssid.to_string()),
                provisioning_secret: Some(config.provisioning_secret.to_string()),
                sensor_enable_mask: Some(config.sensor_enable_mask.into()),
                startup_mode: Some(config.startup_mode.code().into()),
                provisioning_channel: Some(config.provisioning_channel.into()),
            });
            Ok(())
        }
    }

    fn sample_config() -> DeviceConfig {
        DeviceConfig {
            client_ssid: "greenhouse".into(),
            client_secret: "tomatoes!".into(),
            provisioning_ssid: "node-42".into(),
            provisioning_secret: "letmein42".into(),
            sensor_enable_mask: 0b1111_0000,
            startup_mode: StartupMode::Client,
            provisioning_channel: 11,
        }
    }

    #[test]
    fn test_missing_backend_yields_defaults() {
        let store = ConfigStore::new(MemoryBackend::default(), DeviceConfig::default());
        let report = store.load_report();
        assert!(!report.backend_available);
        assert_eq!(report.config, DeviceConfig::default());
        assert_eq!(report.config.startup_mode, StartupMode::Provisioning);
    }

    #[test]
    fn test_empty_record_falls_through_every_field() {
        let backend = MemoryBackend::default();
        *backend.stored.lock() = Some(RawConfig::default());
        let store = ConfigStore::new(backend, DeviceConfig::default());

        let report = store.load_report();
        assert!(report.backend_available);
        assert!(report.corrected.is_empty());
        assert_eq!(report.config, DeviceConfig::default());
    }

    #[test]
    fn test_empty_strings_use_default() {
        let backend = MemoryBackend::default();
        *backend.stored.lock() = Some(RawConfig {
            provisioning_ssid: Some(String::new()),
            client_ssid: Some("office".into()),
            ..RawConfig::default()
        });
        let store = ConfigStore::new(backend, DeviceConfig::default());

        let config = store.load();
        assert_eq!(config.provisioning_ssid.as_str(), DEFAULT_PROVISIONING_SSID);
        assert_eq!(config.client_ssid.as_str(), "office");
    }

    #[test]
    fn test_out_of_range_numbers_corrected_but_not_persisted() {
        let backend = MemoryBackend::default();
        *backend.stored.lock() = Some(RawConfig {
            sensor_enable_mask: Some(300),
            startup_mode: Some(9),
            provisioning_channel: Some(14),
            ..RawConfig::default()
        });
        let writes = Arc::clone(&backend.writes);
        let stored = Arc::clone(&backend.stored);
        let store = ConfigStore::new(backend, DeviceConfig::default());

        let report = store.load_report();
        assert_eq!(report.config.sensor_enable_mask, DEFAULT_SENSOR_MASK);
        assert_eq!(report.config.startup_mode, StartupMode::Provisioning);
        assert_eq!(report.config.provisioning_channel, DEFAULT_CHANNEL);
        assert_eq!(
            report.corrected,
            vec!["sensor_enable_mask", "startup_mode", "provisioning_channel"]
        );

        assert_eq!(*writes.lock(), 0);
        assert_eq!(stored.lock().as_ref().unwrap().startup_mode, Some(9));
    }

    #[test]
    fn test_unset_startup_mode_is_corrected() {
        let backend = MemoryBackend::default();
        *backend.stored.lock() = Some(RawConfig {
            startup_mode: Some(0),
            ..RawConfig::default()
        });
        let store = ConfigStore::new(backend, DeviceConfig::default());
        assert_eq!(store.load().startup_mode, StartupMode::Provisioning);
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let store = ConfigStore::new(MemoryBackend::default(), DeviceConfig::default());
        store.save(&sample_config()).unwrap();
        assert_eq!(store.load(), sample_config());

        store.save(&DeviceConfig::default()).unwrap();
        assert_eq!(store.load(), DeviceConfig::default());
    }

    #[test]
    fn test_save_failure_is_surfaced() {
        let backend = MemoryBackend {
            read_only: true,
            ..MemoryBackend::default()
        };
        let store = ConfigStore::new(backend, DeviceConfig::default());
        assert!(store.save(&sample_config()).is_err());
    }

    #[test]
    fn test_json_layout_matches_document_format() {
        let json = serde_json::to_value(sample_config()).unwrap();
        assert_eq!(json["client_ssid"], "greenhouse");
        assert_eq!(json["sensor_enable_mask"], 240);
        assert_eq!(json["startup_mode"], 1);
        assert_eq!(json["provisioning_channel"], 11);
    }
}
