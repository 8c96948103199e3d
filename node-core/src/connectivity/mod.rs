//! Wireless role state machine.
//!
//! ```text
//! Unset --boot--> Client | Provisioning --long press--> Transitioning --> Provisioning | Client
//! ```
//!
//! `Transitioning` is the lock-out state: a long press that arrives while a
//! switch is running is logged and dropped, never queued. Once started a
//! switch always runs to the end and always leaves `Transitioning`, even when
//! teardown or initialisation steps fail.

pub mod mock;
pub mod wpa_cli;

use crate::device::{ConnectivityMode, ConnectivitySnapshot, DeviceHandle, StartupMode};
use crate::events::{Event, EventBus, EventHandler, Topic};
use crate::traits::{AccessPointConfig, ClientCredentials, LinkEvent, WirelessStack};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Client link lost after being associated.
pub const REASON_BEACON_TIMEOUT: u8 = 200;
/// The configured network could not be found.
pub const REASON_NO_AP_FOUND: u8 = 201;
/// The network rejected the credentials.
pub const REASON_AUTH_FAIL: u8 = 202;
/// The role could not be initialised at all.
pub const STATUS_INIT_FAILED: u8 = 255;

/// Address the device answers on while it runs the provisioning network.
pub const PROVISIONING_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

pub const LINK_EVENT_CAPACITY: usize = 16;

/// Creates the channel a wireless stack reports link changes on.
pub fn link_channel() -> (mpsc::Sender<LinkEvent>, mpsc::Receiver<LinkEvent>) {
    mpsc::channel(LINK_EVENT_CAPACITY)
}

/// Pauses inserted during teardown so the stack can settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTimings {
    pub disconnect_settle: Duration,
    pub shutdown_settle: Duration,
}

impl Default for TransitionTimings {
    fn default() -> Self {
        Self {
            disconnect_settle: Duration::from_secs(1),
            shutdown_settle: Duration::from_secs(1),
        }
    }
}

impl TransitionTimings {
    pub fn immediate() -> Self {
        Self {
            disconnect_settle: Duration::ZERO,
            shutdown_settle: Duration::ZERO,
        }
    }
}

pub struct ConnectivityController {
    device: DeviceHandle,
    bus: Arc<EventBus>,
    stack: Arc<dyn WirelessStack>,
    timings: TransitionTimings,
    // Serialises role changes against link-event handling so that an event
    // raised while a role starts is applied after the mode is set.
    role_guard: tokio::sync::Mutex<()>,
    switches: AtomicUsize,
}

impl ConnectivityController {
    pub fn new(
        device: DeviceHandle,
        bus: Arc<EventBus>,
        stack: Arc<dyn WirelessStack>,
        timings: TransitionTimings,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            bus,
            stack,
            timings,
            role_guard: tokio::sync::Mutex::new(()),
            switches: AtomicUsize::new(0),
        })
    }

    /// Subscribes the controller to long presses on the bus.
    pub fn attach(self: &Arc<Self>) {
        self.bus.subscribe(
            Topic::ButtonLongPress,
            Arc::new(LongPressHandler {
                controller: Arc::downgrade(self),
            }),
        );
    }

    /// Number of completed mode switches (boot excluded).
    pub fn switches_completed(&self) -> usize {
        self.switches.load(Ordering::Relaxed)
    }

    /// Brings the stack up in the role the persisted startup mode asks for.
    pub async fn boot(&self) -> ConnectivityMode {
        let _role = self.role_guard.lock().await;
        let (mode, startup) = {
            let record = self.device.lock();
            (record.connectivity_mode(), record.startup_mode)
        };
        if mode != ConnectivityMode::Unset {
            tracing::warn!(?mode, "Boot requested on an already running controller, ignoring");
            return mode;
        }

        let target = match startup {
            StartupMode::Client => ConnectivityMode::Client,
            StartupMode::Provisioning | StartupMode::Unset => ConnectivityMode::Provisioning,
        };
        tracing::info!(?startup, ?target, "Booting wireless stack");
        let snapshot = self.enter_role(target).await;
        self.bus.publish(Event::ConnectivityChanged(snapshot));
        target
    }

    /// Starts a mode switch in the background unless one is already running.
    pub fn on_long_press(self: &Arc<Self>) -> Option<JoinHandle<ConnectivityMode>> {
        let previous = self.begin_transition()?;
        let controller = Arc::clone(self);
        Some(tokio::spawn(async move { controller.run_transition(previous).await }))
    }

    /// Runs a full mode switch on the caller's task.
    /// Returns the mode reached, or `None` when the switch was refused.
    pub async fn switch_mode(&self) -> Option<ConnectivityMode> {
        let previous = self.begin_transition()?;
        Some(self.run_transition(previous).await)
    }

    // Check-and-set under the record lock, so two presses can never both pass.
    fn begin_transition(&self) -> Option<ConnectivityMode> {
        let mut record = self.device.lock();
        match record.connectivity_mode() {
            ConnectivityMode::Transitioning => {
                tracing::info!("Mode switch already in progress, ignoring long press");
                None
            }
            ConnectivityMode::Unset => {
                tracing::warn!("Wireless stack not booted yet, ignoring long press");
                None
            }
            previous @ (ConnectivityMode::Client | ConnectivityMode::Provisioning) => {
                record.set_connectivity_mode(ConnectivityMode::Transitioning);
                Some(previous)
            }
        }
    }

    async fn run_transition(&self, previous: ConnectivityMode) -> ConnectivityMode {
        let _role = self.role_guard.lock().await;
        let target = match previous {
            ConnectivityMode::Client => ConnectivityMode::Provisioning,
            _ => ConnectivityMode::Client,
        };
        tracing::info!(from = ?previous, to = ?target, "Switching wireless mode");

        self.teardown().await;
        let snapshot = self.enter_role(target).await;
        self.switches.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(Event::ConnectivityChanged(snapshot));
        target
    }

    // Best effort: every step runs even when an earlier one failed.
    async fn teardown(&self) {
        if let Err(e) = self.stack.disconnect().await {
            tracing::warn!("Disconnect failed, continuing teardown: {}", e);
        }
        tokio::time::sleep(self.timings.disconnect_settle).await;
        if let Err(e) = self.stack.release_interfaces().await {
            tracing::warn!("Releasing interfaces failed, continuing teardown: {}", e);
        }
        if let Err(e) = self.stack.stop().await {
            tracing::warn!("Stopping radio failed, continuing teardown: {}", e);
        }
        if let Err(e) = self.stack.deinit().await {
            tracing::warn!("Deinitialising stack failed, continuing teardown: {}", e);
        }
        tokio::time::sleep(self.timings.shutdown_settle).await;
        self.device.set_current_address(None);
    }

    // Starts the role and records the outcome. The mode is set to `target`
    // even when the stack refused to start.
    async fn enter_role(&self, target: ConnectivityMode) -> ConnectivitySnapshot {
        match target {
            ConnectivityMode::Client => {
                let credentials = {
                    let record = self.device.lock();
                    ClientCredentials {
                        ssid: record.client_ssid.clone(),
                        secret: record.client_secret.clone(),
                    }
                };
                tracing::info!(ssid = %credentials.ssid, "Starting client role");
                let status = match self.stack.start_client(&credentials).await {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::error!("Client role failed to start: {}", e);
                        STATUS_INIT_FAILED
                    }
                };
                self.device.update(|record| {
                    record.client_status = status;
                    record.current_address = None;
                });
            }
            ConnectivityMode::Provisioning => {
                let ap = {
                    let record = self.device.lock();
                    AccessPointConfig {
                        ssid: record.provisioning_ssid.clone(),
                        secret: record.provisioning_secret.clone(),
                        channel: record.provisioning_channel,
                    }
                };
                tracing::info!(ssid = %ap.ssid, channel = ap.channel, open = ap.is_open(), "Starting provisioning role");
                let (status, address) = match self.stack.start_provisioning(&ap).await {
                    Ok(address) => (0, Some(address)),
                    Err(e) => {
                        tracing::error!("Provisioning role failed to start: {}", e);
                        (STATUS_INIT_FAILED, None)
                    }
                };
                self.device.update(|record| {
                    record.provisioning_status = status;
                    record.current_address = address;
                });
            }
            ConnectivityMode::Unset | ConnectivityMode::Transitioning => {
                tracing::error!(?target, "Refusing to enter a non-role mode");
                return self.device.connectivity();
            }
        }

        let snapshot = self.device.update(|record| {
            record.set_connectivity_mode(target);
            record.connectivity()
        });
        tracing::info!(mode = ?snapshot.mode, address = ?snapshot.current_address, "Wireless mode active");
        snapshot
    }

    /// Applies a link notification from the stack.
    ///
    /// Only client-mode events change the record; everything else is logged.
    pub async fn handle_link_event(&self, event: LinkEvent) {
        let _role = self.role_guard.lock().await;
        let snapshot = match event {
            LinkEvent::ClientDisconnected { reason } => self.device.update(|record| {
                if record.connectivity_mode() != ConnectivityMode::Client {
                    return None;
                }
                record.client_status = reason;
                record.current_address = None;
                Some(record.connectivity())
            }),
            LinkEvent::GotAddress(address) => self.device.update(|record| {
                if record.connectivity_mode() != ConnectivityMode::Client {
                    return None;
                }
                record.client_status = 0;
                record.current_address = Some(address);
                Some(record.connectivity())
            }),
            LinkEvent::StationJoined { ref mac } => {
                tracing::info!(%mac, "Station joined provisioning network");
                None
            }
            LinkEvent::StationLeft { ref mac } => {
                tracing::info!(%mac, "Station left provisioning network");
                None
            }
        };

        match snapshot {
            Some(snapshot) => {
                tracing::info!(
                    status = snapshot.client_status,
                    address = ?snapshot.current_address,
                    "Client link changed"
                );
                self.bus.publish(Event::ConnectivityChanged(snapshot));
            }
            None => tracing::debug!(?event, "Link event needs no state change"),
        }
    }

    /// Feeds link events from `rx` into the controller until the stack goes away.
    pub fn spawn_link_listener(self: &Arc<Self>, mut rx: mpsc::Receiver<LinkEvent>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                controller.handle_link_event(event).await;
            }
            tracing::debug!("Link event channel closed");
        })
    }

    /// Asks the platform layer to restart the process.
    pub fn request_restart(&self) -> bool {
        tracing::info!("Restart requested");
        self.bus.publish(Event::RestartRequested)
    }
}

struct LongPressHandler {
    controller: Weak<ConnectivityController>,
}

#[async_trait]
impl EventHandler for LongPressHandler {
    async fn handle(&self, _event: &Event) {
        if let Some(controller) = self.controller.upgrade() {
            controller.on_long_press();
        }
    }
}
