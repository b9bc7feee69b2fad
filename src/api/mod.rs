//! Query and live-update interfaces.
//!
//! Serves the point-in-time pull queries (`/api/stats`, `/api/flows`) and
//! the WebSocket upgrade endpoint (`/ws`) that registers new live
//! subscribers with the broadcast hub.

mod error;

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
pub use error::ApiError;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    conf::ApiConf,
    hub::{SubscriberSet, UpdateSink},
    stats::SharedStats,
};

#[derive(Clone)]
pub struct AppState {
    pub stats: SharedStats,
    pub subscribers: Arc<SubscriberSet>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stats", get(stats_handler))
        .route("/api/flows", get(flows_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Aggregate summary: totals, uptime, histograms, flow count.
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.stats.lock().await.summary();
    Json(summary)
}

/// Full flow table dump, unordered across flows, unpaginated.
async fn flows_handler(State(state): State<AppState>) -> impl IntoResponse {
    let flows = state.stats.lock().await.flows();
    Json(flows)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| register_subscriber(state, socket))
}

async fn register_subscriber(state: AppState, socket: WebSocket) {
    match state
        .subscribers
        .register(Box::new(WsSink(socket)), &state.stats)
        .await
    {
        Ok(id) => debug!(
            event.name = "ws.subscribed",
            subscriber.id = id,
            "websocket subscriber registered"
        ),
        Err(e) => debug!(
            event.name = "ws.registration_failed",
            error.message = %e,
            "websocket subscriber dropped during registration"
        ),
    }
}

/// Production [`UpdateSink`] backed by an axum WebSocket connection.
struct WsSink(WebSocket);

#[async_trait]
impl UpdateSink for WsSink {
    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        self.0
            .send(Message::Text(text.to_owned()))
            .await
            .map_err(Into::into)
    }

    async fn close(&mut self) {
        let _ = self.0.send(Message::Close(None)).await;
    }
}

/// Binds the API listener. A bind failure here is fatal at startup.
pub async fn bind(conf: &ApiConf) -> Result<TcpListener, ApiError> {
    let address = format!("{}:{}", conf.listen_address, conf.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| ApiError::bind_address(&address, e))?;

    info!(
        event.name = "api.started",
        net.listen.address = %address,
        "api server listening"
    );
    Ok(listener)
}

/// Serves requests until the shutdown signal arrives.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ApiError> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(ApiError::ServeError)
}
