//! Named groups of connections for scoped fan-out.
//!
//! Membership is a many-to-many relation kept as two mirrored maps. Both
//! sides are updated under the same lock, so a reader never observes a pair
//! present on one side only. Delivery always goes through the
//! [`ConnectionPool`]; this registry holds ids, never connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::channel::Payload;
use super::connection::Connection;
use super::pool::ConnectionPool;
use crate::error::WebSocketError;

#[derive(Debug, Default)]
struct Membership {
    groups: HashMap<String, HashSet<String>>,
    connections: HashMap<String, HashSet<String>>,
}

impl Membership {
    /// Returns the group size after the insert.
    fn insert(&mut self, connection_id: &str, group: &str) -> usize {
        let members = self.groups.entry(group.to_string()).or_default();
        members.insert(connection_id.to_string());
        let size = members.len();
        self.connections
            .entry(connection_id.to_string())
            .or_default()
            .insert(group.to_string());
        size
    }

    fn remove(&mut self, connection_id: &str, group: &str) -> bool {
        let mut removed = false;
        if let Some(members) = self.groups.get_mut(group) {
            removed = members.remove(connection_id);
            if members.is_empty() {
                self.groups.remove(group);
            }
        }
        if let Some(groups) = self.connections.get_mut(connection_id) {
            groups.remove(group);
            if groups.is_empty() {
                self.connections.remove(connection_id);
            }
        }
        removed
    }

    fn remove_all(&mut self, connection_id: &str) -> Vec<String> {
        let Some(groups) = self.connections.remove(connection_id) else {
            return Vec::new();
        };
        for group in &groups {
            if let Some(members) = self.groups.get_mut(group) {
                members.remove(connection_id);
                if members.is_empty() {
                    self.groups.remove(group);
                }
            }
        }
        groups.into_iter().collect()
    }
}

pub struct GroupRegistry {
    pool: Arc<ConnectionPool>,
    membership: RwLock<Membership>,
}

impl GroupRegistry {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            membership: RwLock::new(Membership::default()),
        }
    }

    pub async fn add_to_group(&self, connection_id: &str, group: &str) {
        if connection_id.is_empty() || group.is_empty() {
            return;
        }
        let size = self.membership.write().await.insert(connection_id, group);
        info!(
            "Connection {} joined group {}, members: {}",
            connection_id, group, size
        );
    }

    pub async fn remove_from_group(&self, connection_id: &str, group: &str) {
        if connection_id.is_empty() || group.is_empty() {
            return;
        }
        if self.membership.write().await.remove(connection_id, group) {
            info!("Connection {} left group {}", connection_id, group);
        }
    }

    /// Drops the connection from every group. Must run whenever a connection
    /// terminates, or dead ids linger as members.
    pub async fn remove_from_all_groups(&self, connection_id: &str) {
        if connection_id.is_empty() {
            return;
        }
        let left = self.membership.write().await.remove_all(connection_id);
        if !left.is_empty() {
            info!(
                "Connection {} removed from {} groups",
                connection_id,
                left.len()
            );
        }
    }

    /// Delivers to every open member and returns how many members were open
    /// at dispatch. Members missing from the pool, not open, or whose
    /// delivery fails are pruned from the group.
    pub async fn send_to_group(&self, group: &str, payload: Payload) -> usize {
        if group.is_empty() {
            return 0;
        }
        let member_ids: Vec<String> = match self.membership.read().await.groups.get(group) {
            Some(members) => members.iter().cloned().collect(),
            None => return 0,
        };

        let mut dead = Vec::new();
        let mut targets = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            match self.pool.get(&id).await {
                Some(connection) if connection.is_active() => targets.push(id),
                _ => dead.push(id),
            }
        }

        let dispatched = targets.len();
        let attempts = targets.iter().map(|id| {
            let payload = payload.clone();
            async move { (id, self.pool.send_to(id, payload).await) }
        });
        for (id, delivered) in join_all(attempts).await {
            if !delivered {
                dead.push(id.clone());
            }
        }

        if !dead.is_empty() {
            let mut membership = self.membership.write().await;
            for id in &dead {
                membership.remove(id, group);
            }
            debug!("Pruned {} dead members from group {}", dead.len(), group);
        }

        info!(
            "Sent message to group {}, dispatched to {} connections",
            group, dispatched
        );
        dispatched
    }

    pub async fn send_text_to_group(&self, group: &str, message: &str) -> usize {
        self.send_to_group(group, Payload::Text(message.to_string())).await
    }

    pub async fn send_binary_to_group(&self, group: &str, data: &[u8]) -> usize {
        self.send_to_group(group, Payload::Binary(data.to_vec())).await
    }

    pub async fn send_object_to_group<T: Serialize + ?Sized>(
        &self,
        group: &str,
        value: &T,
    ) -> Result<usize, WebSocketError> {
        let text = serde_json::to_string(value)?;
        Ok(self.send_to_group(group, Payload::Text(text)).await)
    }

    /// Members of the group that are still registered in the pool.
    pub async fn connections_in_group(&self, group: &str) -> Vec<Arc<Connection>> {
        let member_ids: Vec<String> = match self.membership.read().await.groups.get(group) {
            Some(members) => members.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let mut connections = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            if let Some(connection) = self.pool.get(&id).await {
                connections.push(connection);
            }
        }
        connections
    }

    pub async fn member_ids(&self, group: &str) -> Vec<String> {
        self.membership
            .read()
            .await
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn groups_for_connection(&self, connection_id: &str) -> Vec<String> {
        self.membership
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn all_groups(&self) -> Vec<String> {
        self.membership.read().await.groups.keys().cloned().collect()
    }

    pub async fn member_count(&self, group: &str) -> usize {
        self.membership
            .read()
            .await
            .groups
            .get(group)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub async fn group_count(&self) -> usize {
        self.membership.read().await.groups.len()
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }
}
