use anyhow::Result;
use std::path::PathBuf;

mod button;
mod restart;
mod runner;

/// Environment variable naming an alternative settings file.
const SETTINGS_ENV: &str = "NODE_SETTINGS";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging is the entry point's job.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // 2. First argument wins over the environment; neither means built-in settings.
    let settings_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(SETTINGS_ENV).map(PathBuf::from));

    match runner::run(settings_path.as_deref()).await {
        Ok(exit) => {
            tracing::info!(?exit, "Node daemon exiting");
            std::process::exit(exit.code());
        }
        Err(e) => {
            tracing::error!("Node daemon failed: {:#}", e);
            std::process::exit(1);
        }
    }
}
