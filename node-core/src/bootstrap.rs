//! Power-on sequencing.
//!
//! 1. zeroed device record
//! 2. volume manager and config store
//! 3. load (self-healing save when the store is missing or unreadable)
//! 4. event bus with its subscribers, then the consumer task
//! 5. connectivity boot and the link listener
//! 6. housekeeping tick for deferred unmounts

use crate::config::NodeSettings;
use crate::config_store::ConfigStore;
use crate::connectivity::ConnectivityController;
use crate::device::DeviceHandle;
use crate::events::EventBus;
use crate::factory;
use crate::fs_resource::{DirectoryVolume, FsResourceManager};
use crate::indicator::StatusIndicator;
use crate::traits::{LinkEvent, UiAssetProvider, WirelessStack};
use crate::web_server::AppState;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Orchestrator {
    settings: NodeSettings,
    device: DeviceHandle,
    fs: Arc<FsResourceManager>,
    store: Arc<ConfigStore>,
    bus: Arc<EventBus>,
    controller: Arc<ConnectivityController>,
    indicator: Arc<StatusIndicator>,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub async fn bootstrap(
        settings: NodeSettings,
        stack: Arc<dyn WirelessStack>,
        link_rx: mpsc::Receiver<LinkEvent>,
    ) -> Result<Self> {
        tracing::info!(data_dir = %settings.data_dir.display(), "Bootstrapping node");
        let device = DeviceHandle::new();

        let fs = FsResourceManager::new(
            DirectoryVolume::new(&settings.data_dir, true),
            settings.unmount_delay(),
            settings.lock_timeout(),
        );
        let store = Arc::new(factory::create_config_store(&settings, &fs));

        let loader = Arc::clone(&store);
        let report = tokio::task::spawn_blocking(move || loader.load_report()).await?;
        if !report.corrected.is_empty() {
            tracing::warn!(fields = ?report.corrected, "Loaded config had out-of-range values");
        }
        if !report.backend_available {
            tracing::info!(backend = store.backend_name(), "No usable config store, writing defaults");
            let writer = Arc::clone(&store);
            let defaults = report.config.clone();
            match tokio::task::spawn_blocking(move || writer.save(&defaults)).await? {
                Ok(()) => tracing::info!("Config store recreated"),
                Err(e) => tracing::error!("Self-healing save failed, running on defaults: {}", e),
            }
        }
        device.apply_config(&report.config);

        let bus = EventBus::new(settings.event_queue_capacity);
        let indicator = StatusIndicator::new();
        indicator.attach(&bus);
        let controller = ConnectivityController::new(
            device.clone(),
            Arc::clone(&bus),
            stack,
            settings.transition_timings(),
        );
        controller.attach();

        let mut tasks = vec![bus.start()?];
        tasks.push(controller.spawn_link_listener(link_rx));
        let mode = controller.boot().await;
        tracing::info!(?mode, "Connectivity up");

        tasks.push(fs.spawn_housekeeping(settings.housekeeping_tick()));

        Ok(Self {
            settings,
            device,
            fs,
            store,
            bus,
            controller,
            indicator,
            tasks,
        })
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn controller(&self) -> &Arc<ConnectivityController> {
        &self.controller
    }

    pub fn fs(&self) -> &Arc<FsResourceManager> {
        &self.fs
    }

    pub fn indicator(&self) -> &Arc<StatusIndicator> {
        &self.indicator
    }

    /// State for the settings web server.
    pub fn app_state(&self, frontend: Arc<dyn UiAssetProvider>) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.device.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            frontend,
        ))
    }

    /// Stops background tasks and unmounts the volume if it is idle.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        match self.fs.unmount_now() {
            Ok(true) => tracing::info!("Volume unmounted"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Volume not unmounted on shutdown: {}", e),
        }
    }
}
