//! Axum-based relay server: the WebSocket bus plus the automation routes.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use canvas_sync_core::PROTOCOL_VERSION;

use crate::connection::handle_ws_connection;
use crate::facade::{Automation, error_status};
use crate::state::RelayState;

/// Build the relay router.
///
/// `/ws` is the peer bus; `/tools` exposes the automation facade over HTTP.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/tools", get(tools_handler))
        .route("/tools/{tool}", post(invoke_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the relay on the configured bind address and port.
pub async fn start_relay(state: Arc<RelayState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.bind, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Relay listening on {addr}");

    #[allow(unused_mut)]
    let mut app = router(state.clone());

    #[cfg(feature = "metrics")]
    {
        match crate::metrics::install_prometheus_recorder() {
            Ok(handle) => {
                app = app.route(
                    "/metrics",
                    get(move || {
                        let handle = handle.clone();
                        async move { handle.render() }
                    }),
                );
                info!("Prometheus metrics available at http://{addr}/metrics");
            }
            Err(e) => warn!(%e, "Metrics recorder not installed"),
        }
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            state.disconnect_all().await;
        })
        .await?;

    info!("Relay stopped");
    Ok(())
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
///
/// Open peer sockets are closed on shutdown.
pub async fn serve<F>(listener: TcpListener, state: Arc<RelayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            shutdown.await;
            state.disconnect_all().await;
        })
        .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let (connections, nodes) = {
        let hub = state.hub.lock().await;
        (hub.connections.len(), hub.mirror.len())
    };

    Json(json!({
        "status": "ok",
        "version": version,
        "protocol": PROTOCOL_VERSION,
        "connections": connections,
        "nodes": nodes,
        "pending_requests": state.pending.len(),
    }))
}

async fn tools_handler() -> impl IntoResponse {
    Json(json!({ "tools": Automation::tool_names() }))
}

async fn invoke_handler(
    State(state): State<Arc<RelayState>>,
    Path(tool): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let args: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(args) => args,
            Err(e) => {
                warn!(tool = %tool, %e, "Rejected tool call with malformed JSON body");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid JSON body: {e}") })),
                );
            }
        }
    };

    match Automation::new(state).invoke(&tool, args).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_error(e.kind());

            let status =
                StatusCode::from_u16(error_status(&e)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status.is_server_error() {
                warn!(tool = %tool, %e, "Tool call failed");
            }
            (status, Json(e.to_payload()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
