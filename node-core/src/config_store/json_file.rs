use super::{ConfigBackend, DeviceConfig, RawConfig};
use crate::fs_resource::FsResourceManager;
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::sync::Arc;

pub const DEFAULT_FILE_NAME: &str = "device.json";

/// Current-generation store: one JSON document on the managed volume.
///
/// Every access holds an [`crate::fs_resource::FsLease`] for its duration.
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never sees a half-written document.
pub struct JsonFileBackend {
    fs: Arc<FsResourceManager>,
    file_name: String,
}

impl JsonFileBackend {
    pub fn new(fs: Arc<FsResourceManager>) -> Self {
        Self::with_file_name(fs, DEFAULT_FILE_NAME)
    }

    pub fn with_file_name(fs: Arc<FsResourceManager>, file_name: impl Into<String>) -> Self {
        Self {
            fs,
            file_name: file_name.into(),
        }
    }
}

impl ConfigBackend for JsonFileBackend {
    fn name(&self) -> &'static str {
        "json_file"
    }

    fn read(&self) -> Result<RawConfig> {
        let lease = self.fs.acquire()?;
        let path = lease.path(&self.file_name);
        let contents = fs::read_to_string(&path)?;
        let document: Value = serde_json::from_str(&contents)?;
        let Value::Object(fields) = document else {
            return Err(Error::CorruptStore(format!(
                "{} does not hold a JSON object",
                path.display()
            )));
        };

        Ok(RawConfig {
            client_ssid: string_field(&fields, "client_ssid"),
            client_secret: string_field(&fields, "client_secret"),
            provisioning_ssid: string_field(&fields, "provisioning_ssid"),
            provisioning_secret: string_field(&fields, "provisioning_secret"),
            sensor_enable_mask: integer_field(&fields, "sensor_enable_mask"),
            startup_mode: integer_field(&fields, "startup_mode"),
            provisioning_channel: integer_field(&fields, "provisioning_channel"),
        })
    }

    fn write(&self, config: &DeviceConfig) -> Result<()> {
        let lease = self.fs.acquire()?;
        let path = lease.path(&self.file_name);
        let tmp_path = lease.path(&format!("{}.tmp", self.file_name));

        let body = serde_json::to_vec_pretty(config)?;
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&body)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp_path);
        })?;
        tracing::debug!(path = %path.display(), bytes = body.len(), "Config document written");
        Ok(())
    }
}

// A field of the wrong JSON type counts as missing.
fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(s) => Some(s.clone()),
        other => {
            tracing::warn!(key, value = %other, "Ignoring non-string config field");
            None
        }
    }
}

fn integer_field(fields: &Map<String, Value>, key: &str) -> Option<i64> {
    let value = fields.get(key)?;
    let parsed = value.as_i64();
    if parsed.is_none() {
        tracing::warn!(key, %value, "Ignoring non-integer config field");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{ConfigStore, DEFAULT_SENSOR_MASK};
    use crate::device::StartupMode;
    use crate::fs_resource::{DirectoryVolume, MountState};
    use std::io;
    use std::time::Duration;

    fn is_missing(err: &Error) -> bool {
        matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    fn manager(root: &std::path::Path) -> Arc<FsResourceManager> {
        FsResourceManager::new(
            DirectoryVolume::new(root, true),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_missing_document_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(manager(dir.path()));
        let err = backend.read().unwrap_err();
        assert!(is_missing(&err));
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let fs = manager(dir.path());
        let store = ConfigStore::new(JsonFileBackend::new(Arc::clone(&fs)), DeviceConfig::default());

        let config = DeviceConfig {
            client_ssid: "barn".into(),
            client_secret: "hay-bales".into(),
            startup_mode: StartupMode::Client,
            sensor_enable_mask: 0x0F,
            ..DeviceConfig::default()
        };
        store.save(&config).unwrap();

        assert!(dir.path().join(DEFAULT_FILE_NAME).is_file());
        assert!(!dir.path().join("device.json.tmp").exists());
        assert_eq!(store.load(), config);

        // Both accesses released their lease; one mount served both.
        assert_eq!(fs.mount_count(), 1);
        assert!(matches!(fs.state(), MountState::Lingering { .. }));
    }

    #[test]
    fn test_round_trip_at_field_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(JsonFileBackend::new(manager(dir.path())), DeviceConfig::default());

        let full_ssid = "s".repeat(32);
        let full_secret = "k".repeat(64);
        // two-byte character ending exactly on the 32-byte limit
        let multibyte_ssid = format!("{}é", "a".repeat(30));
        let cases = [
            (full_ssid.as_str(), full_secret.as_str(), 0u8, StartupMode::Client, 1u8),
            (multibyte_ssid.as_str(), "p", 255, StartupMode::Provisioning, 13),
            ("x", full_secret.as_str(), 255, StartupMode::Client, 13),
            (full_ssid.as_str(), "", 0, StartupMode::Provisioning, 1),
        ];

        for (ssid, secret, mask, startup_mode, channel) in cases {
            let config = DeviceConfig {
                client_ssid: ssid.into(),
                client_secret: secret.into(),
                provisioning_ssid: ssid.into(),
                provisioning_secret: full_secret.as_str().into(),
                provisioning_channel: channel,
                sensor_enable_mask: mask,
                startup_mode,
            };
            assert_eq!(config.client_ssid.as_str(), ssid, "no truncation expected");
            store.save(&config).unwrap();

            let report = store.load_report();
            assert!(report.corrected.is_empty(), "{ssid:?}/{mask}/{channel}");
            assert_eq!(report.config, config);
        }
    }

    #[test]
    fn test_partial_document_defaults_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(DEFAULT_FILE_NAME),
            r#"{ "client_ssid": "pumphouse", "sensor_enable_mask": "lots" }"#,
        )
        .unwrap();
        let store = ConfigStore::new(JsonFileBackend::new(manager(dir.path())), DeviceConfig::default());

        let report = store.load_report();
        assert!(report.backend_available);
        assert_eq!(report.config.client_ssid.as_str(), "pumphouse");
        assert_eq!(report.config.sensor_enable_mask, DEFAULT_SENSOR_MASK);
    }

    #[test]
    fn test_corrupt_document_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_FILE_NAME), "{ not json").unwrap();
        let store = ConfigStore::new(JsonFileBackend::new(manager(dir.path())), DeviceConfig::default());

        let report = store.load_report();
        assert!(!report.backend_available);
        assert_eq!(report.config, DeviceConfig::default());
    }

    #[test]
    fn test_non_object_document_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_FILE_NAME), "[1, 2, 3]").unwrap();
        let backend = JsonFileBackend::new(manager(dir.path()));
        assert!(matches!(backend.read(), Err(Error::CorruptStore(_))));
    }

    #[test]
    fn test_save_fails_when_volume_cannot_mount() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        let fs = FsResourceManager::new(
            DirectoryVolume::new(&missing, false),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let store = ConfigStore::new(JsonFileBackend::new(Arc::clone(&fs)), DeviceConfig::default());

        assert!(matches!(store.save(&DeviceConfig::default()), Err(Error::Mount { .. })));
        assert_eq!(fs.state(), MountState::Unmounted);
    }
}
