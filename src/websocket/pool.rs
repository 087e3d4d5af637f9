use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::channel::{Payload, RawChannel};
use super::connection::{Connection, DEFAULT_CLOSE_TIMEOUT};
use crate::error::WebSocketError;

/// Registry of every live connection, keyed by connection id.
#[derive(Debug)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    close_timeout: parking_lot::RwLock<Duration>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            close_timeout: parking_lot::RwLock::new(DEFAULT_CLOSE_TIMEOUT),
        }
    }

    /// Close handshake timeout given to connections added from now on.
    pub fn set_close_timeout(&self, timeout: Duration) {
        *self.close_timeout.write() = timeout;
    }

    pub fn close_timeout(&self) -> Duration {
        *self.close_timeout.read()
    }

    /// Wraps the channel in a [`Connection`], stores it and returns its id.
    pub async fn add(&self, channel: RawChannel) -> String {
        let connection = Arc::new(Connection::with_close_timeout(channel, self.close_timeout()));
        let id = connection.id().to_string();

        let mut connections = self.connections.write().await;
        connections.insert(id.clone(), connection);
        info!(
            "Added connection {} to pool, active connections: {}",
            id,
            connections.len()
        );
        id
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(id).is_some();
        if removed {
            info!(
                "Removed connection {} from pool, active connections: {}",
                id,
                connections.len()
            );
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Point-in-time snapshot; later mutations are not reflected.
    pub async fn list_all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Delivers to every open connection concurrently and returns how many
    /// deliveries succeeded. Connections that are not open or whose delivery
    /// fails are removed from the pool.
    pub async fn broadcast(&self, payload: Payload) -> usize {
        let snapshot = self.list_all().await;
        let mut dead = Vec::new();
        let mut targets = Vec::with_capacity(snapshot.len());

        for connection in snapshot {
            if connection.is_active() {
                targets.push(connection);
            } else {
                dead.push(connection.id().to_string());
            }
        }

        let attempts = targets.iter().map(|connection| {
            let payload = payload.clone();
            async move {
                let result = connection.send(payload).await;
                (connection.id().to_string(), result)
            }
        });

        let mut delivered = 0;
        for (id, result) in join_all(attempts).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    error!("Failed to broadcast to connection {}: {}", id, e);
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            self.remove_many(&dead).await;
        }

        debug!(
            "Broadcast delivered to {} connections, pruned {}",
            delivered,
            dead.len()
        );
        delivered
    }

    pub async fn broadcast_text(&self, message: &str) -> usize {
        self.broadcast(Payload::Text(message.to_string())).await
    }

    pub async fn broadcast_binary(&self, data: &[u8]) -> usize {
        self.broadcast(Payload::Binary(data.to_vec())).await
    }

    pub async fn broadcast_object<T: Serialize + ?Sized>(&self, value: &T) -> Result<usize, WebSocketError> {
        let text = serde_json::to_string(value)?;
        Ok(self.broadcast(Payload::Text(text)).await)
    }

    /// Sends to one connection. Unknown ids and failed deliveries both return
    /// false; a failed delivery also removes the connection.
    pub async fn send_to(&self, id: &str, payload: Payload) -> bool {
        let Some(connection) = self.get(id).await else {
            return false;
        };

        match connection.send(payload).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send message to connection {}: {}", id, e);
                self.remove(id).await;
                false
            }
        }
    }

    pub async fn send_text_to(&self, id: &str, message: &str) -> bool {
        self.send_to(id, Payload::Text(message.to_string())).await
    }

    pub async fn send_binary_to(&self, id: &str, data: &[u8]) -> bool {
        self.send_to(id, Payload::Binary(data.to_vec())).await
    }

    pub async fn send_object_to<T: Serialize + ?Sized>(
        &self,
        id: &str,
        value: &T,
    ) -> Result<bool, WebSocketError> {
        let text = serde_json::to_string(value)?;
        Ok(self.send_to(id, Payload::Text(text)).await)
    }

    async fn remove_many(&self, ids: &[String]) {
        let mut connections = self.connections.write().await;
        for id in ids {
            if connections.remove(id).is_some() {
                warn!("Removed dead connection {}", id);
            }
        }
        info!("Active connections after pruning: {}", connections.len());
    }
}
