use serde::{Deserialize, Serialize};

/// Control frames the server pushes on its own. Application payloads are
/// opaque to the core and never go through this type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every accepted connection.
    #[serde(rename = "connection")]
    Connection { id: String },
    /// Unsolicited heartbeat; milliseconds since the Unix epoch.
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
}
