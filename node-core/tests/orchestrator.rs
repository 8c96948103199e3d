use node_core::bootstrap::Orchestrator;
use node_core::config::{ConfigBackendKind, NodeSettings};
use node_core::config_store::{DEFAULT_PROVISIONING_SSID, DeviceConfig};
use node_core::connectivity::mock::{MockWireless, StackStep};
use node_core::connectivity::{PROVISIONING_ADDRESS, REASON_NO_AP_FOUND, link_channel};
use node_core::device::{ConnectivityMode, ConnectivitySnapshot, StartupMode};
use node_core::events::{Event, Topic};
use node_core::frontends::provider_embed::EmbedFrontend;
use node_core::indicator::LedPattern;
use node_core::traits::LinkEvent;
use node_core::web_server::router;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tower::ServiceExt;

fn settings(dir: &tempfile::TempDir, backend: ConfigBackendKind) -> NodeSettings {
    NodeSettings {
        data_dir: dir.path().join("data"),
        config_backend: backend,
        unmount_delay_ms: 20,
        housekeeping_tick_ms: 5,
        disconnect_settle_ms: 0,
        shutdown_settle_ms: 0,
        ..NodeSettings::default()
    }
}

fn watch(orchestrator: &Orchestrator, topic: Topic) -> UnboundedReceiver<Event> {
    let (tx, rx) = unbounded_channel();
    orchestrator.bus().subscribe_fn(topic, move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
        }
    });
    rx
}

// Skips changes published before the subscription (the boot change, say).
async fn next_change(
    rx: &mut UnboundedReceiver<Event>,
    matches: impl Fn(&ConnectivitySnapshot) -> bool,
) -> ConnectivitySnapshot {
    loop {
        match rx.recv().await {
            Some(Event::ConnectivityChanged(snapshot)) if matches(&snapshot) => return snapshot,
            Some(_) => continue,
            None => panic!("event bus closed"),
        }
    }
}

#[tokio::test]
async fn test_first_boot_writes_defaults_and_provisions() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir, ConfigBackendKind::Json);
    let stack = Arc::new(MockWireless::new());
    let (_link_tx, link_rx) = link_channel();

    let orchestrator = Orchestrator::bootstrap(settings.clone(), stack.clone(), link_rx)
        .await
        .unwrap();

    let record = orchestrator.device().snapshot();
    assert_eq!(record.to_config(), DeviceConfig::default());
    assert_eq!(record.startup_mode, StartupMode::Provisioning);
    assert_eq!(record.provisioning_ssid.as_str(), DEFAULT_PROVISIONING_SSID);
    assert_eq!(record.connectivity_mode(), ConnectivityMode::Provisioning);
    assert_eq!(record.current_address, Some(PROVISIONING_ADDRESS));
    assert_eq!(stack.calls(), vec![StackStep::StartProvisioning]);

    // The self-healing save created the store.
    assert!(settings.data_dir.join("device.json").is_file());
    let report = orchestrator.store().load_report();
    assert!(report.backend_available);
    assert_eq!(report.config, DeviceConfig::default());

    // Boot load and self-healing save shared one mount, released after the delay.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(orchestrator.fs().unmount_count(), orchestrator.fs().mount_count());

    orchestrator.shutdown();
}

#[tokio::test]
async fn test_boot_with_key_value_store_in_client_mode() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir, ConfigBackendKind::KeyValue);
    std::fs::create_dir_all(&settings.data_dir).unwrap();
    std::fs::write(
        settings.data_dir.join("settings.kv"),
        "ss=\"orchard\"\nsp=\"apples-123\"\nwm=1\nsm=3\n",
    )
    .unwrap();

    let stack = Arc::new(MockWireless::new());
    let (_link_tx, link_rx) = link_channel();
    let orchestrator = Orchestrator::bootstrap(settings, stack.clone(), link_rx)
        .await
        .unwrap();

    assert_eq!(orchestrator.device().connectivity_mode(), ConnectivityMode::Client);
    assert_eq!(orchestrator.device().sensor_enable_mask(), 3);
    assert_eq!(stack.last_client_ssid().as_deref(), Some("orchard"));
    orchestrator.shutdown();
}

#[tokio::test]
async fn test_client_link_loss_reaches_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir, ConfigBackendKind::Json);
    std::fs::create_dir_all(&settings.data_dir).unwrap();
    std::fs::write(
        settings.data_dir.join("device.json"),
        r#"{"client_ssid":"orchard","client_secret":"apples-123","startup_mode":1}"#,
    )
    .unwrap();

    let (link_tx, link_rx) = link_channel();
    let stack = Arc::new(MockWireless::new());
    let orchestrator = Orchestrator::bootstrap(settings, stack, link_rx).await.unwrap();
    let mut changes = watch(&orchestrator, Topic::ConnectivityChanged);

    link_tx
        .send(LinkEvent::GotAddress(Ipv4Addr::new(192, 168, 1, 50)))
        .await
        .unwrap();
    let connected = next_change(&mut changes, |s| s.current_address.is_some()).await;
    assert_eq!(connected.current_address, Some(Ipv4Addr::new(192, 168, 1, 50)));
    assert_eq!(connected.client_status, 0);

    link_tx
        .send(LinkEvent::ClientDisconnected {
            reason: REASON_NO_AP_FOUND,
        })
        .await
        .unwrap();
    let Some(Event::ConnectivityChanged(lost)) = changes.recv().await else {
        panic!("expected a connectivity change");
    };
    assert_eq!(lost.client_status, REASON_NO_AP_FOUND);
    assert_eq!(lost.current_address, None);
    assert_eq!(orchestrator.indicator().pattern(), LedPattern::Error);
    orchestrator.shutdown();
}

#[tokio::test]
async fn test_provisioning_form_submission() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir, ConfigBackendKind::Json);
    let (_link_tx, link_rx) = link_channel();
    let orchestrator = Orchestrator::bootstrap(settings, Arc::new(MockWireless::new()), link_rx)
        .await
        .unwrap();
    let mut restarts = watch(&orchestrator, Topic::RestartRequested);
    let app = router(orchestrator.app_state(Arc::new(EmbedFrontend::new())));

    let request = axum::http::Request::post("/settings")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(axum::body::Body::from(
            "sta_ssid=greenhouse&sta_pass=tomatoes&startup_mode=1",
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    assert_eq!(restarts.recv().await, Some(Event::RestartRequested));
    assert_eq!(orchestrator.device().client_ssid().as_str(), "greenhouse");
    assert_eq!(orchestrator.device().startup_mode(), StartupMode::Client);

    let stored = orchestrator.store().load();
    assert_eq!(stored.client_ssid.as_str(), "greenhouse");
    assert_eq!(stored.client_secret.as_str(), "tomatoes");
    // The running mode only changes after the restart.
    assert_eq!(
        orchestrator.device().connectivity_mode(),
        ConnectivityMode::Provisioning
    );
    orchestrator.shutdown();
}

#[tokio::test]
async fn test_long_press_switches_modes() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir, ConfigBackendKind::Json);
    let (_link_tx, link_rx) = link_channel();
    let stack = Arc::new(MockWireless::new());
    let orchestrator = Orchestrator::bootstrap(settings, stack.clone(), link_rx)
        .await
        .unwrap();
    let mut changes = watch(&orchestrator, Topic::ConnectivityChanged);

    orchestrator.bus().publish(Event::ButtonLongPress);
    let snapshot = next_change(&mut changes, |s| s.mode == ConnectivityMode::Client).await;
    assert_eq!(snapshot.current_address, None);
    assert_eq!(orchestrator.controller().switches_completed(), 1);
    assert_eq!(stack.calls().last(), Some(&StackStep::StartClient));
    orchestrator.shutdown();
}
