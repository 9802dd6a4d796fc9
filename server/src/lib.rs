//! Callflow Server - signaling relay and call log for Callflow clients
//!
//! This server handles:
//! - Call-log rows (`/api/v1/calls`) that record each call's lifecycle
//! - Realtime relay of call signaling between connected users
//! - Time-limited TURN credentials

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod models;
pub mod storage;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;
use axum::{
    routing::{get, patch, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::storage::Storage;
use crate::websocket::WebSocketManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub ws_manager: Arc<WebSocketManager>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let storage = Storage::new(&config.storage.database_path).await?;
        Ok(Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            ws_manager: Arc::new(WebSocketManager::new()),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(handlers::health::health_check))

        // Call log
        .route("/api/v1/calls", get(handlers::calls::list_calls))
        .route("/api/v1/calls/start", post(handlers::calls::start_call))
        .route("/api/v1/calls/:call_id/status", patch(handlers::calls::update_status))

        // TURN credentials
        .route("/api/v1/turn/credentials", get(handlers::turn::get_credentials))

        // WebSocket for call signaling
        .route("/ws", get(handlers::websocket::websocket_handler))

        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Periodically mark calls nobody answered as missed.
pub fn spawn_ringing_sweep(state: &AppState) -> tokio::task::JoinHandle<()> {
    let storage = Arc::clone(&state.storage);
    let every = Duration::from_secs(state.config.storage.cleanup_interval_minutes.max(1) * 60);
    let stale_after = state.config.storage.stale_ringing_minutes;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match storage.mark_stale_ringing(stale_after).await {
                Ok(0) => {}
                Ok(swept) => tracing::info!("Sweep: marked {} unanswered calls as missed", swept),
                Err(e) => tracing::error!("Sweep failed: {}", e),
            }
        }
    })
}
