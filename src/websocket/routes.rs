//! Path → handler table consulted by the upgrade adapters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionEvent, ReceivedMessage};
use super::messages::ServerMessage;
use crate::error::{AppError, WebSocketError};

/// Services one upgraded connection until it ends.
pub type RouteHandler =
    Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, Result<(), AppError>> + Send + Sync>;

#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, RouteHandler>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_route(&self, path: &str) -> bool {
        self.routes.read().contains_key(path)
    }

    /// Registers `handler` for `path`, replacing any previous one.
    pub fn add_route<F, Fut>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let path = path.into();
        let handler: RouteHandler = Arc::new(move |connection| Box::pin(handler(connection)));
        if self.routes.write().insert(path.clone(), handler).is_some() {
            info!("Replaced WebSocket route {}", path);
        } else {
            info!("Registered WebSocket route {}", path);
        }
    }

    pub fn remove_route(&self, path: &str) -> bool {
        self.routes.write().remove(path).is_some()
    }

    pub fn paths(&self) -> Vec<String> {
        self.routes.read().keys().cloned().collect()
    }

    pub async fn dispatch(&self, path: &str, connection: Arc<Connection>) -> Result<(), AppError> {
        // Clone out of the lock so a long-lived handler never blocks add_route.
        let handler = self.routes.read().get(path).cloned();
        match handler {
            Some(handler) => handler(connection).await,
            None => Err(WebSocketError::RouteNotFound(path.to_string()).into()),
        }
    }
}

/// Application logic for inbound messages on a route.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, connection: &Connection, message: ReceivedMessage) -> Result<(), AppError>;
}

/// Default handler: records each inbound message.
pub struct LoggingMessageHandler;

#[async_trait]
impl MessageHandler for LoggingMessageHandler {
    async fn handle_message(&self, connection: &Connection, message: ReceivedMessage) -> Result<(), AppError> {
        match &message.text {
            Some(text) => info!("Received message on connection {}: {}", connection.id(), text),
            None => info!(
                "Received {} byte binary message on connection {}",
                message.data.len(),
                connection.id()
            ),
        }
        Ok(())
    }
}

/// Standard route body: announce the connection id, then run the receive
/// loop and feed every message to `handler` in arrival order.
pub async fn serve_messages(
    connection: Arc<Connection>,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), AppError> {
    let mut events = connection.subscribe().ok_or_else(|| {
        AppError::InternalError(format!(
            "events of connection {} already taken",
            connection.id()
        ))
    })?;

    connection
        .send_object(&ServerMessage::Connection {
            id: connection.id().to_string(),
        })
        .await?;

    let receive = connection.run_receive_loop();
    let consume = async {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(message) => {
                    if let Err(e) = handler.handle_message(&connection, message).await {
                        warn!("Message handler failed on connection {}: {}", connection.id(), e);
                    }
                }
                ConnectionEvent::Disconnected => break,
            }
        }
        debug!("Stopped consuming events for connection {}", connection.id());
    };
    tokio::join!(receive, consume);
    Ok(())
}

/// Route handler wrapping [`serve_messages`].
pub fn message_route(
    handler: Arc<dyn MessageHandler>,
) -> impl Fn(Arc<Connection>) -> BoxFuture<'static, Result<(), AppError>> + Send + Sync + 'static {
    move |connection| {
        let handler = handler.clone();
        Box::pin(serve_messages(connection, handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::channel::{memory_channel, CloseCode, PeerFrame};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_route_table() {
        let table = RouteTable::new();
        assert!(!table.has_route("/ws"));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        table.add_route("/ws", move |_connection| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert!(table.has_route("/ws"));
        assert!(!table.has_route("/ws/"));

        let (channel, _peer) = memory_channel(None);
        let connection = Arc::new(Connection::new(channel));
        table.dispatch("/ws", connection.clone()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = table.dispatch("/other", connection).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::WebSocketError(WebSocketError::RouteNotFound(ref p)) if p == "/other"
        ));

        assert!(table.remove_route("/ws"));
        assert!(table.paths().is_empty());
    }

    #[tokio::test]
    async fn test_add_route_replaces_handler() {
        let table = RouteTable::new();
        table.add_route("/ws", |_c| async { Err(AppError::InternalError("old".into())) });
        table.add_route("/ws", |_c| async { Ok(()) });

        let (channel, _peer) = memory_channel(None);
        assert!(table.dispatch("/ws", Arc::new(Connection::new(channel))).await.is_ok());
        assert_eq!(table.paths(), vec!["/ws".to_string()]);
    }

    #[tokio::test]
    async fn test_serve_messages_delivers_in_order() {
        let mut mock = MockMessageHandler::new();
        let mut seq = mockall::Sequence::new();
        for expected in ["first", "second"] {
            mock.expect_handle_message()
                .withf(move |_, message| message.text.as_deref() == Some(expected))
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let (channel, mut peer) = memory_channel(None);
        let connection = Arc::new(Connection::new(channel));
        peer.send_text("first");
        peer.send_text("second");
        peer.send_close(CloseCode::Normal, "bye");

        serve_messages(connection.clone(), Arc::new(mock)).await.unwrap();

        match peer.recv().await {
            Some(PeerFrame::Text(text)) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "connection");
                assert_eq!(value["id"], connection.id());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_the_loop() {
        let mut mock = MockMessageHandler::new();
        mock.expect_handle_message()
            .times(2)
            .returning(|_, _| Err(AppError::ValidationError("bad".into())));

        let (channel, peer) = memory_channel(None);
        let connection = Arc::new(Connection::new(channel));
        peer.send_text("a");
        peer.send_text("b");
        peer.send_close(CloseCode::Normal, "bye");

        serve_messages(connection, Arc::new(mock)).await.unwrap();
    }
}
