pub mod config;
pub mod error;
pub mod websocket;

use std::sync::Arc;
use actix_web::{web, HttpResponse};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use error::{AppError, WebSocketError};
pub type Result<T> = std::result::Result<T, AppError>;
pub use config::Settings;

use websocket::{HeartbeatConfig, LoggingMessageHandler, WebSocketServer};

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and push-core counters
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let connections = state.ws_server.pool().connection_count().await;
    let groups = state.ws_server.groups().group_count().await;

    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": connections,
        "groups": groups,
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub ws_server: Arc<WebSocketServer>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Settings) -> Result<Self> {
        config.validate()?;

        let ws_server = WebSocketServer::with_message_route(
            &config.websocket.path,
            Arc::new(LoggingMessageHandler),
        );
        ws_server
            .pool()
            .set_close_timeout(config.websocket.close_timeout());

        Ok(Self {
            config: Arc::new(config),
            ws_server: Arc::new(ws_server),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the heartbeat monitor; it runs until [`AppState::shutdown`].
    pub fn start_heartbeat(&self) -> JoinHandle<()> {
        let config = HeartbeatConfig::from(&self.config.websocket);
        self.ws_server
            .heartbeat_monitor(config)
            .spawn(self.shutdown.child_token())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let closed = self.ws_server.close_all("server shutting down").await;
        info!("Closed {} WebSocket connections during shutdown", closed);
        Ok(())
    }
}
