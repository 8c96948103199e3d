use async_trait::async_trait;
use std::borrow::Cow;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::device::{Secret, Ssid};

/// Credentials used to join an existing network as a station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub ssid: Ssid,
    pub secret: Secret,
}

/// Access point parameters for provisioning mode.
/// An empty secret means an open network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPointConfig {
    pub ssid: Ssid,
    pub secret: Secret,
    pub channel: u8,
}

impl AccessPointConfig {
    pub fn is_open(&self) -> bool {
        self.secret.is_empty()
    }
}

/// Asynchronous notifications coming from the wireless stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The station link dropped or could not be established.
    ClientDisconnected { reason: u8 },
    /// The station obtained an address.
    GotAddress(Ipv4Addr),
    /// A phone or laptop joined the provisioning access point.
    StationJoined { mac: String },
    StationLeft { mac: String },
}

/// Control surface of the wireless stack.
///
/// Implementations report link changes through the `LinkEvent` sender they
/// were constructed with; the calls below only drive role setup and teardown.
#[async_trait]
pub trait WirelessStack: Send + Sync {
    /// Initialises the stack as a station and starts connecting.
    async fn start_client(&self, credentials: &ClientCredentials) -> crate::Result<()>;

    /// Initialises the stack as an access point and returns its address.
    async fn start_provisioning(&self, ap: &AccessPointConfig) -> crate::Result<Ipv4Addr>;

    /// Drops the current association, if any.
    async fn disconnect(&self) -> crate::Result<()>;

    /// Releases the network interface resources of the active role.
    async fn release_interfaces(&self) -> crate::Result<()>;

    /// Stops the radio.
    async fn stop(&self) -> crate::Result<()>;

    /// Fully deinitialises the stack so that a different role can start.
    async fn deinit(&self) -> crate::Result<()>;
}

/// The single mountable volume holding the file-backed store.
///
/// Both calls may block for the duration of the underlying operation.
pub trait Volume: Send + Sync {
    fn root(&self) -> &Path;

    fn mount(&self) -> io::Result<()>;

    fn unmount(&self) -> io::Result<()>;
}

/// Raw reading source of the temperature sensor channels.
pub trait SensorSource: Send + Sync {
    fn read_channel(&self, index: usize) -> Option<u16>;
}

/// 前端资源提供者接口。
#[async_trait]
pub trait UiAssetProvider: Send + Sync {
    /// Retrieves a single UI asset.
    ///
    /// # Arguments
    /// * `path` - The path to the asset (e.g., "settings.html").
    ///
    /// # Returns
    /// The asset's content and its MIME type, or an `Error` if not found.
    async fn get_asset(&self, path: &str) -> crate::Result<(Cow<'static, [u8]>, String)>;
}
