//! WebSocket push core
//!
//! Connection tracking, named groups, fan-out delivery, route dispatch for
//! upgraded sockets and the heartbeat monitor that reaps idle peers.

mod channel;
mod connection;
mod groups;
mod heartbeat;
pub mod http;
mod messages;
mod pool;
mod routes;
mod server;

pub use channel::{
    memory_channel, CloseCode, Frame, FrameSink, FrameSource, MemoryPeer, MessageKind, Payload,
    PeerFrame, RawChannel,
};
pub use connection::{Connection, ConnectionEvent, ConnectionState, ReceivedMessage};
pub use groups::GroupRegistry;
pub use heartbeat::{CycleReport, HeartbeatConfig, HeartbeatMonitor};
pub use messages::ServerMessage;
pub use pool::ConnectionPool;
pub use routes::{message_route, serve_messages, LoggingMessageHandler, MessageHandler, RouteHandler, RouteTable};
pub use server::WebSocketServer;
