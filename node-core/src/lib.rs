//! Core library for the sensor node orchestrator.
//! This crate owns the shared device record, the event bus that connects
//! producers and consumers, the wireless connectivity state machine and the
//! persistent configuration store with its mount lifecycle. The HTTP settings
//! surface and the status indicator are thin collaborators built on top.

pub mod bootstrap;
pub mod config;
pub mod config_store;
pub mod connectivity;
pub mod device;
pub mod events;
pub mod factory;
pub mod frontends;
pub mod fs_resource;
pub mod indicator;
pub mod traits;
pub mod web_server;

// Define a shared Error and Result type for the entire crate.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to mount volume at {root}: {source}")]
    Mount {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out waiting for lock on {0}")]
    LockTimeout(&'static str),

    #[error("Corrupt configuration store: {0}")]
    CorruptStore(String),

    #[error("Wireless stack error: {0}")]
    Wireless(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Event consumer already started")]
    ConsumerRunning,

    #[error("Web server error: {0}")]
    WebServer(#[from] axum::BoxError),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
