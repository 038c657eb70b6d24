use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::state::SharedState;
use crate::store;

/// How often the live socket checks for a new report or command.
const LIVE_POLL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub store_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/sensor/latest", get(sensor_latest))
        .route("/reconciler/state", get(reconciler_state))
        .route("/segments", get(segments))
        .route("/live", get(live))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn sensor_latest(State(state): State<AppState>) -> Response {
    let st = state.shared.read().await;
    match &st.latest_report {
        Some(latest) => Json(latest.report).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No sensor data available yet" })),
        )
            .into_response(),
    }
}

async fn reconciler_state(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_reconciler_snapshot())
}

#[derive(Deserialize)]
struct SegmentsQuery {
    #[serde(default = "default_segment_count")]
    n: usize,
}

fn default_segment_count() -> usize {
    50
}

async fn segments(State(state): State<AppState>, Query(q): Query<SegmentsQuery>) -> Response {
    match store::last_segments(&state.store_dir, q.n).await {
        Ok(paths) => {
            let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            Json(json!({ "segments": names })).into_response()
        }
        Err(e) => {
            tracing::warn!("listing segments failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{e:#}") })),
            )
                .into_response()
        }
    }
}

async fn live(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_live(socket, state.shared))
}

/// Push `{"report": ..}` / `{"command": ..}` whenever either changes, until the
/// client closes the socket or a send fails.
async fn stream_live(mut socket: WebSocket, shared: SharedState) {
    let mut ticker = tokio::time::interval(LIVE_POLL);
    let mut report_seq = 0;
    let mut command_seq = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            incoming = socket.recv() => {
                // Pings are answered by the socket itself while reading.
                if client_gone(&incoming) {
                    tracing::debug!("live socket closed by client");
                    return;
                }
                continue;
            }
        }

        let mut outgoing = Vec::new();
        {
            let st = shared.read().await;
            if let Some(latest) = st.latest_report.as_ref().filter(|r| r.seq != report_seq) {
                report_seq = latest.seq;
                outgoing.push(json!({ "report": latest.report }));
            }
            if let Some(latest) = st.latest_command.as_ref().filter(|c| c.seq != command_seq) {
                command_seq = latest.seq;
                outgoing.push(json!({ "command": latest.command }));
            }
        }

        for msg in outgoing {
            if let Err(e) = socket.send(Message::Text(msg.to_string().into())).await {
                tracing::debug!("live socket closed: {e}");
                return;
            }
        }
    }
}

/// True once the client has closed, dropped, or broken the connection.
fn client_gone(incoming: &Option<Result<Message, axum::Error>>) -> bool {
    matches!(incoming, None | Some(Err(_)) | Some(Ok(Message::Close(_))))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
