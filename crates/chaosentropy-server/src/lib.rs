//! HTTP diagnostics endpoint for a running chaosentropy pipeline.
//!
//! Read-only views of health and throughput, plus the operator re-arm
//! action. Entropy itself is never served here; it leaves through the broker.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use tokio::net::TcpListener;

use chaosentropy_core::health::ChannelState;
use chaosentropy_core::{Channel, DiagnosticsHandle, DiagnosticsSnapshot, HealthStatus};

/// Shared server state.
struct AppState {
    diagnostics: DiagnosticsHandle,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    detail: HealthStatus,
    running: bool,
    channels: BTreeMap<&'static str, &'static str>,
}

#[derive(Serialize)]
struct ChannelEntry {
    name: &'static str,
    index: usize,
    physics: &'static str,
    enabled: bool,
    state: ChannelState,
    samples: u64,
    misses: u64,
    bits_tested: u64,
    ones_fraction: f64,
    rct_max_run: u32,
    apt_max_count: u32,
    halts: u64,
}

#[derive(Serialize)]
struct ChannelsResponse {
    channels: Vec<ChannelEntry>,
    total: usize,
}

#[derive(Serialize)]
struct RearmResponse {
    accepted: bool,
    channels: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn handle_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let snap = state.diagnostics.snapshot();
    let code = match snap.status {
        HealthStatus::Halted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    let channels = snap
        .channels
        .iter()
        .map(|c| (c.channel.name(), c.state.label()))
        .collect();
    (
        code,
        Json(HealthResponse {
            status: snap.status.label(),
            detail: snap.status,
            running: snap.running,
            channels,
        }),
    )
}

async fn handle_diagnostics(State(state): State<Arc<AppState>>) -> Json<DiagnosticsSnapshot> {
    Json(state.diagnostics.snapshot())
}

async fn handle_channels(State(state): State<Arc<AppState>>) -> Json<ChannelsResponse> {
    let snap = state.diagnostics.snapshot();
    let channels: Vec<ChannelEntry> = snap
        .channels
        .into_iter()
        .map(|c| ChannelEntry {
            name: c.channel.name(),
            index: c.channel.index(),
            physics: c.channel.physics(),
            enabled: c.enabled,
            state: c.state,
            samples: c.samples,
            misses: c.misses,
            bits_tested: c.tests.bits_tested,
            ones_fraction: c.ones_fraction,
            rct_max_run: c.tests.rct_max_run,
            apt_max_count: c.tests.apt_max_count,
            halts: c.tests.halts,
        })
        .collect();
    let total = channels.len();
    Json(ChannelsResponse { channels, total })
}

async fn handle_rearm_channel(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<RearmResponse>) {
    match name.parse::<Channel>() {
        Ok(channel) => {
            state.diagnostics.request_rearm(channel);
            (
                StatusCode::ACCEPTED,
                Json(RearmResponse {
                    accepted: true,
                    channels: vec![channel.name()],
                    error: None,
                }),
            )
        }
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(RearmResponse {
                accepted: false,
                channels: Vec::new(),
                error: Some(format!("{e}. Use /channels to list channels.")),
            }),
        ),
    }
}

async fn handle_rearm_all(State(state): State<Arc<AppState>>) -> (StatusCode, Json<RearmResponse>) {
    state.diagnostics.request_rearm_all();
    (
        StatusCode::ACCEPTED,
        Json(RearmResponse {
            accepted: true,
            channels: Channel::ALL.iter().map(|c| c.name()).collect(),
            error: None,
        }),
    )
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.diagnostics.status();
    let channels: Vec<serde_json::Value> = Channel::ALL
        .iter()
        .map(|c| serde_json::json!({ "name": c.name(), "physics": c.physics() }))
        .collect();

    Json(serde_json::json!({
        "name": "chaosentropy diagnostics",
        "version": chaosentropy_core::VERSION,
        "status": status.label(),
        "channels": channels,
        "endpoints": {
            "/": "This API index",
            "/health": "Aggregate health status (503 when halted)",
            "/diagnostics": "Full diagnostics snapshot",
            "/channels": "Per-channel state and test counters",
            "/rearm/{channel}": {
                "method": "POST",
                "description": "Clear a channel halt and restart its tests",
            },
            "/rearm": {
                "method": "POST",
                "description": "Re-arm every channel",
            },
        },
    }))
}

/// Build the axum router.
pub fn build_router(diagnostics: DiagnosticsHandle) -> Router {
    let state = Arc::new(AppState { diagnostics });

    Router::new()
        .route("/", get(handle_index))
        .route("/health", get(handle_health))
        .route("/diagnostics", get(handle_diagnostics))
        .route("/channels", get(handle_channels))
        .route("/rearm", post(handle_rearm_all))
        .route("/rearm/{channel}", post(handle_rearm_channel))
        .with_state(state)
}

/// Serve diagnostics on an already-bound listener.
pub async fn serve(listener: TcpListener, diagnostics: DiagnosticsHandle) -> std::io::Result<()> {
    axum::serve(listener, build_router(diagnostics)).await
}

/// Bind `host:port` and serve diagnostics until the process exits.
pub async fn run_server(diagnostics: DiagnosticsHandle, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    log::info!("diagnostics listening on http://{addr}");
    serve(listener, diagnostics).await
}
