use crate::{button, restart::RestartHandler};
use anyhow::{Context, Result};
use node_core::bootstrap::Orchestrator;
use node_core::config::NodeSettings;
use node_core::connectivity::link_channel;
use node_core::events::Topic;
use node_core::factory;
use node_core::web_server::start_web_server;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;

/// How the daemon ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Ctrl-C or SIGTERM.
    Stopped,
    /// Restart requested after a settings save. The supervisor brings us back.
    Restart,
}

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Exit::Stopped => 0,
            // Non-zero so that `Restart=on-failure` units restart too.
            Exit::Restart => 3,
        }
    }
}

pub async fn run(settings_path: Option<&Path>) -> Result<Exit> {
    let settings = NodeSettings::load(settings_path).context("Failed to load settings")?;
    tracing::info!(
        backend = ?settings.config_backend,
        wireless = ?settings.wireless_backend,
        bind = %settings.bind_addr,
        "Settings loaded"
    );

    let (link_tx, link_rx) = link_channel();
    let stack = factory::create_wireless_stack(&settings, link_tx);
    let orchestrator = Orchestrator::bootstrap(settings.clone(), stack, link_rx)
        .await
        .context("Bootstrap failed")?;

    let (restart_tx, mut restart_rx) = mpsc::channel(1);
    orchestrator.bus().subscribe(
        Topic::RestartRequested,
        Arc::new(RestartHandler::new(restart_tx, settings.restart_delay())),
    );
    let buttons = button::spawn_signal_buttons(Arc::clone(orchestrator.bus()))
        .context("Failed to install button signal handlers")?;

    let state = orchestrator.app_state(factory::create_frontend());
    let mut server = start_web_server(settings.bind_addr, state);

    let exit = tokio::select! {
        result = &mut server => Err(server_stopped(result)),
        Some(()) = restart_rx.recv() => Ok(Exit::Restart),
        _ = shutdown_signal() => Ok(Exit::Stopped),
    };

    server.abort();
    buttons.abort();
    orchestrator.shutdown();
    exit
}

// The server task only finishes on failure.
fn server_stopped(result: std::result::Result<node_core::Result<()>, JoinError>) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("Web server stopped unexpectedly"),
        Ok(Err(e)) => anyhow::Error::new(e).context("Web server failed"),
        Err(e) => anyhow::Error::new(e).context("Web server task panicked"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received"),
        _ = terminate => tracing::info!("SIGTERM received"),
    }
}
