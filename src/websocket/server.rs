use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};

use super::channel::{CloseCode, RawChannel};
use super::groups::GroupRegistry;
use super::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use super::pool::ConnectionPool;
use super::routes::{message_route, MessageHandler, RouteTable};
use crate::error::AppError;

/// Owns the registries and the route table and implements the accept →
/// register → dispatch → unregister flow shared by every transport adapter.
pub struct WebSocketServer {
    pool: Arc<ConnectionPool>,
    groups: Arc<GroupRegistry>,
    routes: Arc<RouteTable>,
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServer {
    pub fn new() -> Self {
        let pool = Arc::new(ConnectionPool::new());
        Self {
            groups: Arc::new(GroupRegistry::new(pool.clone())),
            pool,
            routes: Arc::new(RouteTable::new()),
        }
    }

    /// Server with `path` routed to the standard message loop.
    pub fn with_message_route(path: &str, handler: Arc<dyn MessageHandler>) -> Self {
        let server = Self::new();
        server.routes.add_route(path, message_route(handler));
        server
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    pub fn groups(&self) -> Arc<GroupRegistry> {
        self.groups.clone()
    }

    pub fn routes(&self) -> Arc<RouteTable> {
        self.routes.clone()
    }

    pub fn heartbeat_monitor(&self, config: HeartbeatConfig) -> HeartbeatMonitor {
        HeartbeatMonitor::new(config, self.pool.clone(), self.groups.clone())
    }

    /// Runs one upgraded channel through the route registered for `path`.
    /// Whatever the handler returns, the connection is removed from the pool
    /// and from every group before this returns.
    pub async fn serve(&self, path: &str, channel: RawChannel) -> Result<(), AppError> {
        let connection_id = self.pool.add(channel).await;

        let result = match self.pool.get(&connection_id).await {
            Some(connection) => self.routes.dispatch(path, connection).await,
            None => Err(AppError::InternalError(format!(
                "connection {} vanished before dispatch",
                connection_id
            ))),
        };

        if let Err(e) = &result {
            error!(
                "Error handling WebSocket route {} for connection {}: {}",
                path, connection_id, e
            );
        }

        self.pool.remove(&connection_id).await;
        self.groups.remove_from_all_groups(&connection_id).await;
        info!("Connection {} closed", connection_id);
        result
    }

    /// Accepts a raw TCP stream. Requests for paths without a route are
    /// refused with 404 during the handshake.
    pub async fn handle_connection<S>(self: Arc<Self>, raw_stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("New WebSocket connection from: {}", addr);

        let requested_path = Arc::new(Mutex::new(None::<String>));
        let path_slot = requested_path.clone();
        let routes = self.routes.clone();
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let path = request.uri().path().to_string();
            if !routes.has_route(&path) {
                let mut rejection = ErrorResponse::new(Some(format!("no route for {}", path)));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }
            *path_slot.lock() = Some(path);
            Ok(response)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during WebSocket handshake with {}: {}", addr, e);
                return;
            }
        };

        let Some(path) = requested_path.lock().take() else {
            warn!("Handshake with {} completed without a path", addr);
            return;
        };
        let channel = RawChannel::from_tungstenite(ws_stream, Some(addr));
        // Failures are already logged and cleaned up by serve.
        let _ = self.serve(&path, channel).await;
    }

    /// Closes every live connection. Used on shutdown.
    pub async fn close_all(&self, reason: &str) -> usize {
        let connections = self.pool.list_all().await;
        let mut closed = 0;
        for connection in connections {
            match connection.close_with(CloseCode::GoingAway, reason).await {
                Ok(()) => closed += 1,
                Err(e) => warn!("Failed to close connection {}: {}", connection.id(), e),
            }
        }
        closed
    }
}
