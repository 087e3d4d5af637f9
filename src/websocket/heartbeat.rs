use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::CloseCode;
use super::groups::GroupRegistry;
use super::messages::ServerMessage;
use super::pool::ConnectionPool;
use crate::config::WebSocketConfig;
use crate::error::WebSocketError;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub connection_timeout: Duration,
    pub enable_heartbeat: bool,
    pub enable_timeout_eviction: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(120),
            enable_heartbeat: true,
            enable_timeout_eviction: true,
        }
    }
}

impl From<&WebSocketConfig> for HeartbeatConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            connection_timeout: config.connection_timeout(),
            enable_heartbeat: config.enable_heartbeat,
            enable_timeout_eviction: config.enable_timeout_eviction,
        }
    }
}

/// Outcome of one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub pinged: usize,
    pub ping_failures: usize,
    pub evicted: Vec<String>,
}

/// Pings active connections and reaps the ones idle past the timeout.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    pool: Arc<ConnectionPool>,
    groups: Arc<GroupRegistry>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, pool: Arc<ConnectionPool>, groups: Arc<GroupRegistry>) -> Self {
        Self {
            config,
            pool,
            groups,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Runs cycles until `shutdown` is cancelled. A failure on one connection
    /// never ends the loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Heartbeat monitor started, interval: {:?}, timeout: {:?}",
            self.config.interval, self.config.connection_timeout
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }
            let report = self.check_connections().await;
            if !report.evicted.is_empty() {
                info!("Disconnected {} timed out connections", report.evicted.len());
            }
        }

        info!("Heartbeat monitor stopped");
    }

    /// One cycle: ping the live, evict the idle.
    pub async fn check_connections(&self) -> CycleReport {
        let connections = self.pool.list_all().await;
        let mut report = CycleReport {
            checked: connections.len(),
            ..CycleReport::default()
        };
        debug!("Checking {} WebSocket connections", connections.len());

        let mut expired = Vec::new();
        let mut to_ping = Vec::new();
        for connection in connections {
            let idle = connection.idle_time();
            if self.config.enable_timeout_eviction && idle > self.config.connection_timeout {
                warn!(
                    "Connection {} timed out, last activity: {}, evicting",
                    connection.id(),
                    connection.last_activity()
                );
                expired.push(connection);
                continue;
            }
            if self.config.enable_heartbeat && connection.is_active() {
                to_ping.push(connection);
            }
        }

        // Serialized once per cycle; every ping sends the same text.
        let ping_text = serde_json::to_string(&ServerMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        })
        .map_err(WebSocketError::from);
        let pings = to_ping.iter().map(|connection| {
            let text = ping_text.clone();
            async move {
                let result = match text {
                    Ok(text) => connection.send_ping(text).await,
                    Err(e) => Err(e),
                };
                match &result {
                    Ok(()) => debug!("Sent heartbeat to connection {}", connection.id()),
                    Err(e) => error!(
                        "Failed to send heartbeat to connection {}: {}",
                        connection.id(),
                        e
                    ),
                }
                result.is_ok()
            }
        });
        for ok in join_all(pings).await {
            if ok {
                report.pinged += 1;
            } else {
                report.ping_failures += 1;
            }
        }

        for connection in expired {
            let id = connection.id().to_string();
            if let Err(e) = connection.close_with(CloseCode::Normal, "connection timeout").await {
                error!("Error closing timed out connection {}: {}", id, e);
            }
            self.pool.remove(&id).await;
            self.groups.remove_from_all_groups(&id).await;
            report.evicted.push(id);
        }

        report
    }
}
