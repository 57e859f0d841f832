//! Local HTTP API for the chat transport
//!
//! - `POST /api/invoke`: run one operation, reply with its result
//! - `GET /api/health`: liveness
//! - `GET /ws`: guard events as JSON text frames

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use portguard::{Operation, OperationResult, PortGuard};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
struct ApiState {
    guard: Arc<PortGuard>,
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: String,
    monitoring: bool,
}

pub fn router(guard: Arc<PortGuard>) -> Router {
    Router::new()
        .route("/api/invoke", post(invoke))
        .route("/api/health", get(health_check))
        .route("/ws", get(ws_handler))
        .with_state(ApiState { guard })
}

/// Serve until `cancel` fires.
pub async fn serve(
    guard: Arc<PortGuard>,
    listen_address: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_address).await?;
    info!("Operation API listening on http://{listen_address}");

    axum::serve(listener, router(guard))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn invoke(
    State(state): State<ApiState>,
    Json(operation): Json<Operation>,
) -> Json<OperationResult> {
    Json(state.guard.invoke(operation).await)
}

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").into(),
        monitoring: state.guard.monitoring(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Forward every guard event to the client until either side goes away.
async fn handle_ws(mut socket: WebSocket, state: ApiState) {
    info!("WebSocket client connected");
    let mut events = state.guard.events().subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagging, {skipped} event(s) dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
