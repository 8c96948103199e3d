use crate::config::{ConfigBackendKind, NodeSettings, WirelessBackendKind};
use crate::config_store::json_file::JsonFileBackend;
use crate::config_store::key_value::{self, KeyValueBackend};
use crate::config_store::ConfigStore;
use crate::connectivity::mock::MockWireless;
use crate::connectivity::wpa_cli::WpaCliStack;
use crate::frontends::provider_embed::EmbedFrontend;
use crate::fs_resource::FsResourceManager;
use crate::traits::{LinkEvent, UiAssetProvider, WirelessStack};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Builds the store for the backend generation named in the settings.
///
/// Only the JSON document lives on the managed volume.
pub fn create_config_store(settings: &NodeSettings, fs: &Arc<FsResourceManager>) -> ConfigStore {
    let defaults = settings.device_defaults();
    match settings.config_backend {
        ConfigBackendKind::Json => {
            tracing::info!("Config store: JSON document");
            ConfigStore::new(JsonFileBackend::new(Arc::clone(fs)), defaults)
        }
        ConfigBackendKind::KeyValue => {
            tracing::info!("Config store: legacy key-value");
            let path = settings.data_dir.join(key_value::DEFAULT_FILE_NAME);
            ConfigStore::new(KeyValueBackend::new(path), defaults)
        }
    }
}

/// Builds the wireless stack. Link events are reported on `link_tx`.
pub fn create_wireless_stack(
    settings: &NodeSettings,
    link_tx: mpsc::Sender<LinkEvent>,
) -> Arc<dyn WirelessStack> {
    match settings.wireless_backend {
        WirelessBackendKind::Mock => {
            tracing::info!("Wireless: mock stack (no radio is touched)");
            drop(link_tx);
            Arc::new(MockWireless::new())
        }
        WirelessBackendKind::WpaCli => {
            tracing::info!(iface = %settings.interface_name, "Wireless: wpa_cli stack");
            Arc::new(WpaCliStack::new(
                settings.interface_name.clone(),
                link_tx,
                settings.link_poll(),
            ))
        }
    }
}

pub fn create_frontend() -> Arc<dyn UiAssetProvider> {
    tracing::info!("Frontend: embedded settings UI");
    Arc::new(EmbedFrontend::new())
}
