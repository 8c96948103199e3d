//! Legacy flat key-value store.
//!
//! One `key=value` entry per line, values encoded as JSON scalars so that
//! strings with `=` or newlines survive. Keys are the short names the first
//! firmware generation used.

use super::{ConfigBackend, DeviceConfig, RawConfig};
use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

pub const DEFAULT_FILE_NAME: &str = "settings.kv";

const KEY_PROVISIONING_SSID: &str = "as";
const KEY_PROVISIONING_SECRET: &str = "ap";
const KEY_PROVISIONING_CHANNEL: &str = "ac";
const KEY_CLIENT_SSID: &str = "ss";
const KEY_CLIENT_SECRET: &str = "sp";
const KEY_SENSOR_MASK: &str = "sm";
const KEY_STARTUP_MODE: &str = "wm";

/// Key-value store living directly in the data directory.
///
/// This generation sits on its own partition and never goes through the
/// mount manager.
pub struct KeyValueBackend {
    path: PathBuf,
}

impl KeyValueBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigBackend for KeyValueBackend {
    fn name(&self) -> &'static str {
        "key_value"
    }

    fn read(&self) -> Result<RawConfig> {
        let contents = fs::read_to_string(&self.path)?;
        let entries = parse_entries(&contents);

        let string = |key: &str| match entries.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                tracing::warn!(key, value = %other, "Ignoring non-string entry");
                None
            }
            None => None,
        };
        let integer = |key: &str| match entries.get(key) {
            Some(value) => value.as_i64().or_else(|| {
                tracing::warn!(key, %value, "Ignoring non-integer entry");
                None
            }),
            None => None,
        };

        Ok(RawConfig {
            client_ssid: string(KEY_CLIENT_SSID),
            client_secret: string(KEY_CLIENT_SECRET),
            provisioning_ssid: string(KEY_PROVISIONING_SSID),
            provisioning_secret: string(KEY_PROVISIONING_SECRET),
            sensor_enable_mask: integer(KEY_SENSOR_MASK),
            startup_mode: integer(KEY_STARTUP_MODE),
            provisioning_channel: integer(KEY_PROVISIONING_CHANNEL),
        })
    }

    fn write(&self, config: &DeviceConfig) -> Result<()> {
        let entries: [(&str, Value); 7] = [
            (KEY_PROVISIONING_SSID, config.provisioning_ssid.as_str().into()),
            (KEY_PROVISIONING_SECRET, config.provisioning_secret.as_str().into()),
            (KEY_PROVISIONING_CHANNEL, config.provisioning_channel.into()),
            (KEY_CLIENT_SSID, config.client_ssid.as_str().into()),
            (KEY_CLIENT_SECRET, config.client_secret.as_str().into()),
            (KEY_SENSOR_MASK, config.sensor_enable_mask.into()),
            (KEY_STARTUP_MODE, config.startup_mode.code().into()),
        ];

        let mut body = String::new();
        for (key, value) in entries {
            body.push_str(key);
            body.push('=');
            body.push_str(&value.to_string());
            body.push('\n');
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("kv.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &self.path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp_path);
        })?;
        Ok(())
    }
}

fn parse_entries(contents: &str) -> HashMap<String, Value> {
    let mut entries = HashMap::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw)) = line.split_once('=') else {
            tracing::warn!(line = number + 1, "Skipping malformed entry");
            continue;
        };
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => {
                entries.insert(key.trim().to_owned(), value);
            }
            Err(e) => tracing::warn!(line = number + 1, key, "Skipping unparsable value: {}", e),
        }
    }
    entries
}
