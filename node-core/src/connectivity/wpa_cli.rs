//! Wireless stack driven through `wpa_cli`, `hostapd` and `dnsmasq`.
//!
//! The radio runs one role at a time. Provisioning brings up hostapd with a
//! generated config plus a dnsmasq that answers every name with the device
//! address (captive portal). Client mode hands the credentials to
//! wpa_supplicant and polls `wpa_cli status` to turn state changes into
//! [`LinkEvent`]s. While the access point is up, `hostapd_cli all_sta` is
//! polled the same way for stations joining and leaving.

use super::{PROVISIONING_ADDRESS, REASON_AUTH_FAIL, REASON_BEACON_TIMEOUT, REASON_NO_AP_FOUND};
use crate::traits::{AccessPointConfig, ClientCredentials, LinkEvent, WirelessStack};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

const AP_PREFIX_LEN: u8 = 24;
const DHCP_RANGE: &str = "192.168.4.100,192.168.4.200,12h";
const WPA_SUPPLICANT_CONF: &str = "/etc/wpa_supplicant.conf";
const HOSTAPD_CTRL_DIR: &str = "/var/run/hostapd";

pub struct WpaCliStack {
    iface: String,
    link_tx: mpsc::Sender<LinkEvent>,
    poll_interval: Duration,
    hostapd: Mutex<Option<Child>>,
    dnsmasq: Mutex<Option<Child>>,
    udhcpc: Mutex<Option<Child>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    network_id: Mutex<Option<u32>>,
}

impl WpaCliStack {
    pub fn new(iface: impl Into<String>, link_tx: mpsc::Sender<LinkEvent>, poll_interval: Duration) -> Self {
        Self {
            iface: iface.into(),
            link_tx,
            poll_interval,
            hostapd: Mutex::new(None),
            dnsmasq: Mutex::new(None),
            udhcpc: Mutex::new(None),
            monitor: Mutex::new(None),
            network_id: Mutex::new(None),
        }
    }

    fn hostapd_conf_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("node-hostapd-{}.conf", self.iface))
    }

    async fn wpa_cli(&self, args: &[&str]) -> Result<String> {
        run_command("wpa_cli", &self.wpa_cli_args(args)).await
    }

    fn wpa_cli_args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut full = vec!["-i", self.iface.as_str()];
        full.extend_from_slice(args);
        full
    }

    async fn start_monitor(&self) {
        let iface = self.iface.clone();
        let link_tx = self.link_tx.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut tracker = LinkTracker::default();
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                let output = match run_command("wpa_cli", &["-i", iface.as_str(), "status"]).await {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::debug!("wpa_cli status failed: {}", e);
                        continue;
                    }
                };
                for event in tracker.update(&parse_wpa_status(&output)) {
                    if link_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        self.replace_monitor(handle).await;
    }

    async fn start_station_monitor(&self) {
        let iface = self.iface.clone();
        let link_tx = self.link_tx.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut tracker = StationTracker::default();
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                let args = ["-p", HOSTAPD_CTRL_DIR, "-i", iface.as_str(), "all_sta"];
                let output = match run_command("hostapd_cli", &args).await {
                    Ok(output) => output,
                    Err(e) => {
                        tracing::debug!("hostapd_cli all_sta failed: {}", e);
                        continue;
                    }
                };
                for event in tracker.update(parse_all_sta(&output)) {
                    if link_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        self.replace_monitor(handle).await;
    }

    async fn replace_monitor(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.monitor.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl WirelessStack for WpaCliStack {
    async fn start_client(&self, credentials: &ClientCredentials) -> Result<()> {
        tracing::info!(iface = %self.iface, ssid = %credentials.ssid, "[WpaCli] Starting station");

        let conf_arg = format!("-c{WPA_SUPPLICANT_CONF}");
        let iface_arg = format!("-i{}", self.iface);
        if let Err(e) = run_command("wpa_supplicant", &["-B", iface_arg.as_str(), conf_arg.as_str()]).await {
            tracing::debug!("wpa_supplicant not started, assuming it is already running: {}", e);
        }

        let id_output = self.wpa_cli(&["add_network"]).await?;
        let network_id: u32 = id_output.trim().parse().map_err(|_| {
            Error::CommandFailed(format!("Failed to parse network ID from wpa_cli: {}", id_output.trim()))
        })?;
        let id = network_id.to_string();

        let ssid_arg = format!("\"{}\"", credentials.ssid);
        self.wpa_cli(&["set_network", id.as_str(), "ssid", ssid_arg.as_str()]).await?;
        if credentials.secret.is_empty() {
            self.wpa_cli(&["set_network", id.as_str(), "key_mgmt", "NONE"]).await?;
        } else {
            let psk_arg = format!("\"{}\"", credentials.secret);
            self.wpa_cli(&["set_network", id.as_str(), "psk", psk_arg.as_str()]).await?;
        }
        self.wpa_cli(&["enable_network", id.as_str()]).await?;
        *self.network_id.lock().await = Some(network_id);

        // Foreground udhcpc keeps renewing the lease until it is killed.
        let udhcpc = Command::new("udhcpc").arg("-f").arg("-i").arg(&self.iface).spawn()?;
        if let Some(mut previous) = self.udhcpc.lock().await.replace(udhcpc) {
            let _ = previous.kill().await;
        }

        self.start_monitor().await;
        Ok(())
    }

    async fn start_provisioning(&self, ap: &AccessPointConfig) -> Result<Ipv4Addr> {
        tracing::info!(iface = %self.iface, ssid = %ap.ssid, channel = ap.channel, "[WpaCli] Starting access point");

        let conf_path = self.hostapd_conf_path();
        tokio::fs::write(&conf_path, render_hostapd_conf(&self.iface, ap)).await?;

        let cidr = format!("{PROVISIONING_ADDRESS}/{AP_PREFIX_LEN}");
        if let Err(e) = run_command("ip", &["addr", "add", cidr.as_str(), "dev", self.iface.as_str()]).await {
            // Re-entering the role may find the address still assigned.
            if !e.to_string().contains("File exists") {
                return Err(e);
            }
        }

        let hostapd = Command::new("hostapd").arg(&conf_path).spawn()?;
        *self.hostapd.lock().await = Some(hostapd);

        let dnsmasq = Command::new("dnsmasq")
            .arg(format!("--interface={}", self.iface))
            .arg(format!("--dhcp-range={DHCP_RANGE}"))
            .arg(format!("--address=/#/{PROVISIONING_ADDRESS}"))
            .arg("--no-resolv")
            .arg("--no-hosts")
            .arg("--no-daemon")
            .spawn()?;
        *self.dnsmasq.lock().await = Some(dnsmasq);

        self.start_station_monitor().await;
        Ok(PROVISIONING_ADDRESS)
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_monitor().await;
        let Some(id) = self.network_id.lock().await.take() else {
            return Ok(());
        };
        self.wpa_cli(&["disconnect"]).await?;
        let id = id.to_string();
        self.wpa_cli(&["remove_network", id.as_str()]).await?;
        Ok(())
    }

    async fn release_interfaces(&self) -> Result<()> {
        stop_child(&self.udhcpc, "udhcpc").await;
        run_command("ip", &["addr", "flush", "dev", self.iface.as_str()]).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        stop_child(&self.dnsmasq, "dnsmasq").await;
        stop_child(&self.hostapd, "hostapd").await;
        let _ = run_command("killall", &["wpa_supplicant"]).await;
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        let _ = tokio::fs::remove_file(self.hostapd_conf_path()).await;
        run_command("ip", &["link", "set", self.iface.as_str(), "down"]).await?;
        run_command("ip", &["link", "set", self.iface.as_str(), "up"]).await?;
        Ok(())
    }
}

/// Kills the helper held in `slot`, if any. Returns whether one was running.
async fn stop_child(slot: &Mutex<Option<Child>>, name: &str) -> bool {
    let Some(mut child) = slot.lock().await.take() else {
        return false;
    };
    if let Err(e) = child.kill().await {
        tracing::warn!("[WpaCli] Failed to stop {}: {}", name, e);
    }
    true
}

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    tracing::trace!(program, ?args, "Running command");
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::CommandFailed(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Renders a hostapd config for `ap`. An empty secret gives an open network.
pub fn render_hostapd_conf(iface: &str, ap: &AccessPointConfig) -> String {
    let mut conf = format!(
        "interface={iface}\ndriver=nl80211\nctrl_interface={HOSTAPD_CTRL_DIR}\nssid={}\nhw_mode=g\nchannel={}\n",
        ap.ssid, ap.channel
    );
    if !ap.is_open() {
        conf.push_str("wpa=2\nwpa_key_mgmt=WPA-PSK\nrsn_pairwise=CCMP\n");
        conf.push_str(&format!("wpa_passphrase={}\n", ap.secret));
    }
    conf
}

/// The parts of `wpa_cli status` the link monitor looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WpaStatus {
    pub wpa_state: String,
    pub ssid: Option<String>,
    pub ip_address: Option<Ipv4Addr>,
}

pub fn parse_wpa_status(output: &str) -> WpaStatus {
    let mut status = WpaStatus::default();
    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key.trim() {
            "wpa_state" => status.wpa_state = value.trim().to_owned(),
            "ssid" => status.ssid = Some(value.trim().to_owned()),
            "ip_address" => status.ip_address = value.trim().parse().ok(),
            _ => {}
        }
    }
    status
}

/// Station MACs listed by `hostapd_cli all_sta`.
///
/// Each station starts with its bare MAC on a line of its own, followed by
/// `key=value` attribute lines.
pub fn parse_all_sta(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| is_mac(line))
        .map(str::to_ascii_lowercase)
        .collect()
}

fn is_mac(line: &str) -> bool {
    let parts: Vec<&str> = line.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Turns successive station lists into join/leave events.
#[derive(Debug, Default)]
pub struct StationTracker {
    known: BTreeSet<String>,
}

impl StationTracker {
    pub fn update(&mut self, current: BTreeSet<String>) -> Vec<LinkEvent> {
        let mut events: Vec<LinkEvent> = current
            .difference(&self.known)
            .map(|mac| LinkEvent::StationJoined { mac: mac.clone() })
            .collect();
        events.extend(
            self.known
                .difference(&current)
                .map(|mac| LinkEvent::StationLeft { mac: mac.clone() }),
        );
        self.known = current;
        events
    }
}

/// Turns successive status polls into link events.
#[derive(Debug, Default)]
pub struct LinkTracker {
    associated: bool,
    handshake_seen: bool,
    failure_reported: bool,
    address: Option<Ipv4Addr>,
}

impl LinkTracker {
    pub fn update(&mut self, status: &WpaStatus) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        match status.wpa_state.as_str() {
            "COMPLETED" => {
                self.associated = true;
                self.handshake_seen = false;
                self.failure_reported = false;
                if status.ip_address.is_some() && status.ip_address != self.address {
                    self.address = status.ip_address;
                    events.extend(status.ip_address.map(LinkEvent::GotAddress));
                }
            }
            "4WAY_HANDSHAKE" | "GROUP_HANDSHAKE" => self.handshake_seen = true,
            "DISCONNECTED" | "INACTIVE" | "SCANNING" => {
                let reason = if self.associated {
                    Some(REASON_BEACON_TIMEOUT)
                } else if self.handshake_seen {
                    Some(REASON_AUTH_FAIL)
                } else if status.wpa_state != "SCANNING" && !self.failure_reported {
                    Some(REASON_NO_AP_FOUND)
                } else {
                    None
                };
                if let Some(reason) = reason {
                    events.push(LinkEvent::ClientDisconnected { reason });
                    self.associated = false;
                    self.handshake_seen = false;
                    self.failure_reported = true;
                    self.address = None;
                }
            }
            _ => {}
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: &str, ip: Option<&str>) -> WpaStatus {
        WpaStatus {
            wpa_state: state.into(),
            ssid: None,
            ip_address: ip.and_then(|ip| ip.parse().ok()),
        }
    }

    #[test]
    fn test_parse_wpa_status() {
        let output = "bssid=aa:bb:cc:dd:ee:ff\nfreq=2437\nssid=orchard\nid=0\nmode=station\n\
                      wpa_state=COMPLETED\nip_address=192.168.1.40\naddress=11:22:33:44:55:66\n";
        let parsed = parse_wpa_status(output);
        assert_eq!(parsed.wpa_state, "COMPLETED");
        assert_eq!(parsed.ssid.as_deref(), Some("orchard"));
        assert_eq!(parsed.ip_address, Some(Ipv4Addr::new(192, 168, 1, 40)));
    }

    #[test]
    fn test_tracker_reports_address_once() {
        let mut tracker = LinkTracker::default();
        let connected = status("COMPLETED", Some("10.0.0.9"));
        assert_eq!(
            tracker.update(&connected),
            vec![LinkEvent::GotAddress(Ipv4Addr::new(10, 0, 0, 9))]
        );
        assert!(tracker.update(&connected).is_empty());
    }

    #[test]
    fn test_tracker_reports_lost_link() {
        let mut tracker = LinkTracker::default();
        tracker.update(&status("COMPLETED", Some("10.0.0.9")));
        assert_eq!(
            tracker.update(&status("SCANNING", None)),
            vec![LinkEvent::ClientDisconnected {
                reason: REASON_BEACON_TIMEOUT
            }]
        );
        assert!(tracker.update(&status("SCANNING", None)).is_empty());
    }

    #[test]
    fn test_tracker_distinguishes_auth_failure() {
        let mut tracker = LinkTracker::default();
        assert!(tracker.update(&status("SCANNING", None)).is_empty());
        tracker.update(&status("4WAY_HANDSHAKE", None));
        assert_eq!(
            tracker.update(&status("DISCONNECTED", None)),
            vec![LinkEvent::ClientDisconnected {
                reason: REASON_AUTH_FAIL
            }]
        );
    }

    #[test]
    fn test_tracker_reports_missing_network_once() {
        let mut tracker = LinkTracker::default();
        assert_eq!(
            tracker.update(&status("DISCONNECTED", None)),
            vec![LinkEvent::ClientDisconnected {
                reason: REASON_NO_AP_FOUND
            }]
        );
        assert!(tracker.update(&status("DISCONNECTED", None)).is_empty());
    }

    #[tokio::test]
    async fn test_stop_child_kills_only_its_own_helper() {
        let ours = Command::new("sleep").arg("30").spawn().unwrap();
        let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();
        let slot = Mutex::new(Some(ours));

        assert!(stop_child(&slot, "sleep").await);
        assert!(slot.lock().await.is_none());
        assert!(!stop_child(&slot, "sleep").await);

        // Another process with the same name keeps running.
        assert!(bystander.try_wait().unwrap().is_none());
        bystander.kill().await.unwrap();
    }

    #[test]
    fn test_parse_all_sta() {
        let output = "AA:BB:CC:DD:EE:01\nflags=[AUTH][ASSOC][AUTHORIZED]\naid=1\n\
                      rx_bytes=1820\nconnected_time=12\n\
                      aa:bb:cc:dd:ee:02\nflags=[AUTH][ASSOC]\naid=2\n";
        let stations = parse_all_sta(output);
        assert_eq!(
            stations.into_iter().collect::<Vec<_>>(),
            vec!["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]
        );
        assert!(parse_all_sta("FAIL\n").is_empty());
    }

    #[test]
    fn test_station_tracker_reports_joins_and_leaves() {
        let mut tracker = StationTracker::default();
        let phone = "aa:bb:cc:dd:ee:01".to_string();
        let laptop = "aa:bb:cc:dd:ee:02".to_string();

        assert_eq!(
            tracker.update(BTreeSet::from([phone.clone()])),
            vec![LinkEvent::StationJoined { mac: phone.clone() }]
        );
        assert!(tracker.update(BTreeSet::from([phone.clone()])).is_empty());
        assert_eq!(
            tracker.update(BTreeSet::from([laptop.clone()])),
            vec![
                LinkEvent::StationJoined { mac: laptop.clone() },
                LinkEvent::StationLeft { mac: phone },
            ]
        );
        assert_eq!(
            tracker.update(BTreeSet::new()),
            vec![LinkEvent::StationLeft { mac: laptop }]
        );
    }

    #[test]
    fn test_hostapd_conf_open_and_secured() {
        let mut ap = AccessPointConfig {
            ssid: "node-setup".into(),
            secret: "".into(),
            channel: 11,
        };
        let open = render_hostapd_conf("wlan0", &ap);
        assert!(open.contains("ssid=node-setup\n"));
        assert!(open.contains("channel=11\n"));
        assert!(open.contains("ctrl_interface=/var/run/hostapd\n"));
        assert!(!open.contains("wpa_passphrase"));

        ap.secret = "configure-me".into();
        let secured = render_hostapd_conf("wlan0", &ap);
        assert!(secured.contains("wpa_passphrase=configure-me\n"));
    }
}
