//! Relay server
//!
//! Serves the relay over WebSocket at `GET /ws`, one relay connection per
//! socket, and a JSON status document at `GET /health`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::message::ClientFrame;
use crate::relay::Relay;
use crate::util::init_log;

#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self {
            relay,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    channels: usize,
    connections: usize,
    started_at: DateTime<Utc>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    init_log();
    let config = Config::from_env();

    let app = router(AppState::new(Arc::new(Relay::new())));

    let listener = tokio::net::TcpListener::bind(config.relay_bind)
        .await
        .with_context(|| format!("binding relay to {}", config.relay_bind))?;
    info!("Relay listening on ws://{}/ws", listener.local_addr()?);

    axum::serve(listener, app).await.context("relay server")?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        channels: state.relay.channel_count(),
        connections: state.relay.connection_count(),
        started_at: state.started_at,
    })
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>) {
    let (id, mut rx) = relay.connect();
    let (mut sender, mut receiver) = socket.split();

    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match serde_json::to_string(&frame) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode frame: {}", e),
            }
        }
        debug!("Writer for {} ended", writer_id.short());
    });

    info!("Connection {} opened", id.short());

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!("WebSocket error from {}: {}", id.short(), e);
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => relay.handle(&id, frame),
                Err(e) => warn!("Ignoring malformed frame from {}: {}", id.short(), e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    relay.disconnect(&id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_relay_counts() {
        let relay = Arc::new(Relay::new());
        let (a, _rx) = relay.connect();
        relay.join(&a, "room");
        let state = AppState::new(relay);

        let Json(health) = health(State(state.clone())).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.channels, 1);
        assert_eq!(health.connections, 1);
        assert_eq!(health.started_at, state.started_at);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json.get("started_at").is_some());
    }
}
