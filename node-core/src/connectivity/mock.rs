use super::PROVISIONING_ADDRESS;
use crate::traits::{AccessPointConfig, ClientCredentials, LinkEvent, WirelessStack};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackStep {
    StartClient,
    StartProvisioning,
    Disconnect,
    ReleaseInterfaces,
    Stop,
    Deinit,
}

/// A wireless stack that only records what it was asked to do.
/// Selected steps can be told to fail, and a client start can be followed
/// by a simulated address lease.
#[derive(Debug, Default)]
pub struct MockWireless {
    calls: Mutex<Vec<StackStep>>,
    failing: HashSet<StackStep>,
    start_delay: Duration,
    auto_address: Option<(mpsc::Sender<LinkEvent>, Ipv4Addr)>,
    last_client_ssid: Mutex<Option<String>>,
    last_access_point: Mutex<Option<AccessPointConfig>>,
}

impl MockWireless {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, step: StackStep) -> Self {
        self.failing.insert(step);
        self
    }

    /// Role starts take `delay` to complete.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Reports `address` on `link_tx` after every successful client start.
    pub fn with_auto_address(mut self, link_tx: mpsc::Sender<LinkEvent>, address: Ipv4Addr) -> Self {
        self.auto_address = Some((link_tx, address));
        self
    }

    pub fn calls(&self) -> Vec<StackStep> {
        self.calls.lock().clone()
    }

    pub fn last_client_ssid(&self) -> Option<String> {
        self.last_client_ssid.lock().clone()
    }

    pub fn last_access_point(&self) -> Option<AccessPointConfig> {
        self.last_access_point.lock().clone()
    }

    fn record(&self, step: StackStep) -> Result<()> {
        self.calls.lock().push(step);
        if self.failing.contains(&step) {
            tracing::debug!(?step, "[MockWireless] Simulating failure");
            return Err(Error::Wireless(format!("simulated {step:?} failure")));
        }
        tracing::debug!(?step, "[MockWireless] Step done");
        Ok(())
    }
}

#[async_trait]
impl WirelessStack for MockWireless {
    async fn start_client(&self, credentials: &ClientCredentials) -> Result<()> {
        *self.last_client_ssid.lock() = Some(credentials.ssid.to_string());
        sleep(self.start_delay).await;
        self.record(StackStep::StartClient)?;
        if let Some((link_tx, address)) = &self.auto_address {
            let _ = link_tx.try_send(LinkEvent::GotAddress(*address));
        }
        Ok(())
    }

    async fn start_provisioning(&self, ap: &AccessPointConfig) -> Result<Ipv4Addr> {
        *self.last_access_point.lock() = Some(ap.clone());
        sleep(self.start_delay).await;
        self.record(StackStep::StartProvisioning)?;
        Ok(PROVISIONING_ADDRESS)
    }

    async fn disconnect(&self) -> Result<()> {
        self.record(StackStep::Disconnect)
    }

    async fn release_interfaces(&self) -> Result<()> {
        self.record(StackStep::ReleaseInterfaces)
    }

    async fn stop(&self) -> Result<()> {
        self.record(StackStep::Stop)
    }

    async fn deinit(&self) -> Result<()> {
        self.record(StackStep::Deinit)
    }
}
