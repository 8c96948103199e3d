//! The shared device record.
//!
//! There is exactly one [`DeviceRecord`] per process. It is created zeroed,
//! populated once from the configuration store during bootstrap and mutated
//! afterwards by the connectivity controller (mode, status codes, address)
//! and by the settings save path (credentials, sensor mask, startup mode).
//! Components never reach it through a global: they receive a cloned
//! [`DeviceHandle`] in their constructor.

use crate::config_store::DeviceConfig;
use crate::traits::SensorSource;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::Arc;

pub const SSID_MAX_LEN: usize = 32;
pub const SECRET_MAX_LEN: usize = 64;
pub const SENSOR_MAX_COUNT: usize = 8;

/// Current wireless role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMode {
    #[default]
    Unset,
    Client,
    Provisioning,
    /// Lock-out state while a mode switch is running.
    Transitioning,
}

/// Persisted wireless role preference, consulted only at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum StartupMode {
    #[default]
    Unset,
    Client,
    Provisioning,
}

impl StartupMode {
    pub fn code(self) -> u8 {
        match self {
            StartupMode::Unset => 0,
            StartupMode::Client => 1,
            StartupMode::Provisioning => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(StartupMode::Unset),
            1 => Some(StartupMode::Client),
            2 => Some(StartupMode::Provisioning),
            _ => None,
        }
    }
}

impl From<StartupMode> for u8 {
    fn from(mode: StartupMode) -> Self {
        mode.code()
    }
}

impl TryFrom<u8> for StartupMode {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        StartupMode::from_code(code.into()).ok_or_else(|| format!("unknown startup mode {code}"))
    }
}

/// A UTF-8 string holding at most `N` bytes.
///
/// Writes longer than `N` are cut at the last character boundary that fits,
/// they never fail.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BoundedString<const N: usize>(String);

pub type Ssid = BoundedString<SSID_MAX_LEN>;
pub type Secret = BoundedString<SECRET_MAX_LEN>;

impl<const N: usize> BoundedString<N> {
    pub fn new(value: &str) -> Self {
        Self(truncate_utf8(value, N).to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn capacity() -> usize {
        N
    }
}

impl<const N: usize> Deref for BoundedString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl<const N: usize> From<&str> for BoundedString<N> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<const N: usize> From<String> for BoundedString<N> {
    fn from(mut value: String) -> Self {
        let keep = truncate_utf8(&value, N).len();
        value.truncate(keep);
        Self(value)
    }
}

impl<const N: usize> fmt::Debug for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl<const N: usize> fmt::Display for BoundedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<const N: usize> Serialize for BoundedString<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedString<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

fn truncate_utf8(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Indices of the sensor channels selected by `mask`.
pub fn enabled_channels(mask: u8) -> impl Iterator<Item = usize> {
    (0..SENSOR_MAX_COUNT).filter(move |&index| mask & (1u8 << index) != 0)
}

/// Samples every enabled channel from `source`, skipping channels that
/// returned no reading.
pub fn read_enabled_channels(source: &dyn SensorSource, mask: u8) -> Vec<(usize, u16)> {
    enabled_channels(mask)
        .filter_map(|index| source.read_channel(index).map(|raw| (index, raw)))
        .collect()
}

/// Connectivity-related part of the record, carried by `ConnectivityChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectivitySnapshot {
    pub mode: ConnectivityMode,
    pub client_status: u8,
    pub provisioning_status: u8,
    pub current_address: Option<Ipv4Addr>,
}

/// Live and persisted device state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    connectivity_mode: ConnectivityMode,
    pub client_status: u8,
    pub provisioning_status: u8,
    pub current_address: Option<Ipv4Addr>,
    pub client_ssid: Ssid,
    pub client_secret: Secret,
    pub provisioning_ssid: Ssid,
    pub provisioning_secret: Secret,
    pub provisioning_channel: u8,
    pub sensor_enable_mask: u8,
    pub startup_mode: StartupMode,
}

impl DeviceRecord {
    pub fn connectivity_mode(&self) -> ConnectivityMode {
        self.connectivity_mode
    }

    // Only the connectivity controller moves the mode.
    pub(crate) fn set_connectivity_mode(&mut self, mode: ConnectivityMode) {
        self.connectivity_mode = mode;
    }

    pub fn connectivity(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            mode: self.connectivity_mode,
            client_status: self.client_status,
            provisioning_status: self.provisioning_status,
            current_address: self.current_address,
        }
    }

    /// Copies every persisted field from `config`.
    pub fn apply_config(&mut self, config: &DeviceConfig) {
        self.client_ssid = config.client_ssid.clone();
        self.client_secret = config.client_secret.clone();
        self.provisioning_ssid = config.provisioning_ssid.clone();
        self.provisioning_secret = config.provisioning_secret.clone();
        self.provisioning_channel = config.provisioning_channel;
        self.sensor_enable_mask = config.sensor_enable_mask;
        self.startup_mode = config.startup_mode;
    }

    pub fn to_config(&self) -> DeviceConfig {
        DeviceConfig {
            client_ssid: self.client_ssid.clone(),
            client_secret: self.client_secret.clone(),
            provisioning_ssid: self.provisioning_ssid.clone(),
            provisioning_secret: self.provisioning_secret.clone(),
            provisioning_channel: self.provisioning_channel,
            sensor_enable_mask: self.sensor_enable_mask,
            startup_mode: self.startup_mode,
        }
    }
}

/// Cloneable handle to the single device record.
///
/// Every accessor copies under the lock, so no partial write is ever
/// observable. Multi-field read/modify/write sequences go through
/// [`DeviceHandle::lock`] or [`DeviceHandle::update`] and hold the lock for
/// the whole group. Accessors never publish events; callers that change
/// observable state publish explicitly.
#[derive(Debug, Clone, Default)]
pub struct DeviceHandle {
    inner: Arc<Mutex<DeviceRecord>>,
}

impl DeviceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, DeviceRecord> {
        self.inner.lock()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceRecord) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn snapshot(&self) -> DeviceRecord {
        self.inner.lock().clone()
    }

    pub fn connectivity(&self) -> ConnectivitySnapshot {
        self.inner.lock().connectivity()
    }

    pub fn apply_config(&self, config: &DeviceConfig) {
        self.inner.lock().apply_config(config);
    }

    pub fn to_config(&self) -> DeviceConfig {
        self.inner.lock().to_config()
    }

    pub fn connectivity_mode(&self) -> ConnectivityMode {
        self.inner.lock().connectivity_mode
    }

    pub fn client_status(&self) -> u8 {
        self.inner.lock().client_status
    }

    pub fn set_client_status(&self, status: u8) {
        self.inner.lock().client_status = status;
    }

    pub fn provisioning_status(&self) -> u8 {
        self.inner.lock().provisioning_status
    }

    pub fn set_provisioning_status(&self, status: u8) {
        self.inner.lock().provisioning_status = status;
    }

    pub fn current_address(&self) -> Option<Ipv4Addr> {
        self.inner.lock().current_address
    }

    pub fn set_current_address(&self, address: Option<Ipv4Addr>) {
        self.inner.lock().current_address = address;
    }

    pub fn client_ssid(&self) -> Ssid {
        self.inner.lock().client_ssid.clone()
    }

    pub fn set_client_ssid(&self, ssid: &str) {
        self.inner.lock().client_ssid = Ssid::new(ssid);
    }

    pub fn client_secret(&self) -> Secret {
        self.inner.lock().client_secret.clone()
    }

    pub fn set_client_secret(&self, secret: &str) {
        self.inner.lock().client_secret = Secret::new(secret);
    }

    pub fn provisioning_ssid(&self) -> Ssid {
        self.inner.lock().provisioning_ssid.clone()
    }

    pub fn set_provisioning_ssid(&self, ssid: &str) {
        self.inner.lock().provisioning_ssid = Ssid::new(ssid);
    }

    pub fn provisioning_secret(&self) -> Secret {
        self.inner.lock().provisioning_secret.clone()
    }

    pub fn set_provisioning_secret(&self, secret: &str) {
        self.inner.lock().provisioning_secret = Secret::new(secret);
    }

    pub fn sensor_enable_mask(&self) -> u8 {
        self.inner.lock().sensor_enable_mask
    }

    pub fn set_sensor_enable_mask(&self, mask: u8) {
        self.inner.lock().sensor_enable_mask = mask;
    }

    pub fn startup_mode(&self) -> StartupMode {
        self.inner.lock().startup_mode
    }

    pub fn set_startup_mode(&self, mode: StartupMode) {
        self.inner.lock().startup_mode = mode;
    }
}
