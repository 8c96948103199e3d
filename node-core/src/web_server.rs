use crate::config_store::{CHANNEL_RANGE, ConfigStore, DeviceConfig};
use crate::device::{ConnectivityMode, ConnectivitySnapshot, DeviceHandle, StartupMode, enabled_channels};
use crate::events::{Event, EventBus};
use crate::traits::UiAssetProvider;
use axum::{
    Form, Json, Router,
    body::Body,
    extract::{State, rejection::FormRejection, rejection::JsonRejection},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const SETTINGS_PAGE: &str = "settings.html";

// The shared state of the settings server. Collaborators are injected as
// handles so tests can drive the router without a running daemon.
pub type WebServerState = State<Arc<AppState>>;

pub struct AppState {
    pub device: DeviceHandle,
    pub store: Arc<ConfigStore>,
    pub bus: Arc<EventBus>,
    pub frontend: Arc<dyn UiAssetProvider>,
    // Held across snapshot, save and record update of one submission.
    save_guard: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(
        device: DeviceHandle,
        store: Arc<ConfigStore>,
        bus: Arc<EventBus>,
        frontend: Arc<dyn UiAssetProvider>,
    ) -> Self {
        Self {
            device,
            store,
            bus,
            frontend,
            save_guard: tokio::sync::Mutex::new(()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/config", get(api_get_config))
        .route("/api/status", get(api_get_status))
        .route("/api/settings", post(api_post_settings))
        .route("/settings", post(form_post_settings))
        .fallback(serve_static_asset)
        .with_state(state)
}

/// Starts the settings server on `addr`.
///
/// # Returns
/// A `JoinHandle` for the server task.
pub fn start_web_server(addr: SocketAddr, state: Arc<AppState>) -> JoinHandle<crate::Result<()>> {
    let app = router(state);

    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Web server listening");
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(|e| crate::Error::WebServer(e.into()))
    })
}

// --- Views ---

/// Persisted settings as shown to the page. Secrets are never echoed.
#[derive(Debug, Serialize)]
struct ConfigView {
    client_ssid: String,
    client_secret_set: bool,
    provisioning_ssid: String,
    provisioning_open: bool,
    provisioning_channel: u8,
    sensor_enable_mask: u8,
    startup_mode: StartupMode,
}

impl From<DeviceConfig> for ConfigView {
    fn from(config: DeviceConfig) -> Self {
        Self {
            client_ssid: config.client_ssid.to_string(),
            client_secret_set: !config.client_secret.is_empty(),
            provisioning_ssid: config.provisioning_ssid.to_string(),
            provisioning_open: config.provisioning_secret.is_empty(),
            provisioning_channel: config.provisioning_channel,
            sensor_enable_mask: config.sensor_enable_mask,
            startup_mode: config.startup_mode,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    connectivity: ConnectivitySnapshot,
    sensor_enable_mask: u8,
    enabled_channels: Vec<usize>,
}

/// A submitted settings form. Absent fields keep their current value.
///
/// Accepts both the field names of the JSON document and the short names
/// the settings page posts.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsForm {
    #[serde(alias = "sta_ssid")]
    pub client_ssid: Option<String>,
    #[serde(alias = "sta_pass")]
    pub client_secret: Option<String>,
    #[serde(alias = "ap_ssid")]
    pub provisioning_ssid: Option<String>,
    #[serde(alias = "ap_pass")]
    pub provisioning_secret: Option<String>,
    #[serde(alias = "ap_channel")]
    pub provisioning_channel: Option<i64>,
    #[serde(alias = "sensor_mask")]
    pub sensor_enable_mask: Option<i64>,
    pub startup_mode: Option<i64>,
}

impl SettingsForm {
    /// Validates the form and applies it on top of `current`.
    pub fn merge_into(self, mut current: DeviceConfig) -> std::result::Result<DeviceConfig, String> {
        if let Some(mask) = self.sensor_enable_mask {
            current.sensor_enable_mask =
                u8::try_from(mask).map_err(|_| format!("sensor mask {mask} is outside 0..=255"))?;
        }
        if let Some(code) = self.startup_mode {
            current.startup_mode = match StartupMode::from_code(code) {
                Some(mode @ (StartupMode::Client | StartupMode::Provisioning)) => mode,
                _ => return Err(format!("startup mode {code} must be 1 (client) or 2 (provisioning)")),
            };
        }
        if let Some(channel) = self.provisioning_channel {
            current.provisioning_channel = u8::try_from(channel)
                .ok()
                .filter(|c| CHANNEL_RANGE.contains(c))
                .ok_or_else(|| format!("channel {channel} is outside 1..=13"))?;
        }
        if let Some(ssid) = self.client_ssid {
            current.client_ssid = ssid.into();
        }
        if let Some(secret) = self.client_secret {
            current.client_secret = secret.into();
        }
        if let Some(ssid) = self.provisioning_ssid {
            current.provisioning_ssid = ssid.into();
        }
        if let Some(secret) = self.provisioning_secret {
            current.provisioning_secret = secret.into();
        }
        Ok(current)
    }
}

// --- Route Handlers ---

async fn api_get_config(State(state): WebServerState) -> Response {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.load()).await {
        Ok(config) => (StatusCode::OK, Json(ConfigView::from(config))).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn api_get_status(State(state): WebServerState) -> impl IntoResponse {
    let (connectivity, mask) = {
        let record = state.device.lock();
        (record.connectivity(), record.sensor_enable_mask)
    };
    Json(StatusView {
        connectivity,
        sensor_enable_mask: mask,
        enabled_channels: enabled_channels(mask).collect(),
    })
}

async fn form_post_settings(
    State(state): WebServerState,
    form: std::result::Result<Form<SettingsForm>, FormRejection>,
) -> Response {
    match form {
        Ok(Form(form)) => save_settings(&state, form).await,
        Err(rejection) => error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    }
}

async fn api_post_settings(
    State(state): WebServerState,
    payload: std::result::Result<Json<SettingsForm>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(form)) => save_settings(&state, form).await,
        Err(rejection) => error_response(StatusCode::BAD_REQUEST, rejection.body_text()),
    }
}

/// Persists the submitted settings, then updates the record and asks for a
/// restart. Nothing changes in memory when the save fails.
///
/// Submissions are serialized so the store and the record never disagree.
async fn save_settings(state: &AppState, form: SettingsForm) -> Response {
    let _guard = state.save_guard.lock().await;
    let config = match form.merge_into(state.device.to_config()) {
        Ok(config) => config,
        Err(message) => {
            tracing::warn!("Rejecting settings: {}", message);
            return error_response(StatusCode::BAD_REQUEST, message);
        }
    };

    let store = Arc::clone(&state.store);
    let to_save = config.clone();
    let saved = tokio::task::spawn_blocking(move || store.save(&to_save))
        .await
        .map_err(crate::Error::from)
        .and_then(|result| result);
    if let Err(e) = saved {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    state.device.apply_config(&config);
    tracing::info!(ssid = %config.client_ssid, "Settings saved, requesting restart");
    state.bus.publish(Event::RestartRequested);

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "success",
            "message": "Settings saved. Restarting...",
        })),
    )
        .into_response()
}

/// Serves a UI asset; `/` maps to the settings page.
///
/// While the node runs its provisioning network every unknown path is
/// redirected to the settings page so that captive-portal probes land there.
async fn serve_static_asset(State(state): WebServerState, uri: Uri) -> Response {
    let path = match uri.path().trim_start_matches('/') {
        "" => SETTINGS_PAGE,
        path => path,
    };
    match state.frontend.get_asset(path).await {
        Ok((data, mime)) => ([(header::CONTENT_TYPE, mime)], Body::from(data)).into_response(),
        Err(_) if state.device.connectivity_mode() == ConnectivityMode::Provisioning => {
            tracing::debug!(%path, "Redirecting to settings page");
            (StatusCode::FOUND, [(header::LOCATION, format!("/{SETTINGS_PAGE}"))]).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, format!("Asset not found: {}", path)).into_response(),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
