use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{CloseCode, Frame, FrameSink, FrameSource, MessageKind, Payload, RawChannel};
use crate::error::WebSocketError;

/// Lifecycle of the underlying channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    CloseSent = 2,
    CloseReceived = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::CloseSent,
            3 => ConnectionState::CloseReceived,
            _ => ConnectionState::Closed,
        }
    }
}

/// A fully reassembled inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub kind: MessageKind,
    pub data: Vec<u8>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Message(ReceivedMessage),
    Disconnected,
}

pub struct Connection {
    id: String,
    state: AtomicU8,
    connected_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    remote_address: String,
    items: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    sink: Mutex<Box<dyn FrameSink>>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    disconnected: AtomicBool,
    cancel: CancellationToken,
    close_sent: CancellationToken,
    close_sent_at: parking_lot::Mutex<Option<Instant>>,
    close_timeout: Duration,
}

/// How long a peer gets to answer our close frame.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

impl Connection {
    /// Takes ownership of an upgraded channel. The upgrade has completed, so
    /// the connection starts out `Open`.
    pub fn new(channel: RawChannel) -> Self {
        Self::with_close_timeout(channel, DEFAULT_CLOSE_TIMEOUT)
    }

    /// Like [`Connection::new`], but a peer that has not answered our close
    /// frame within `close_timeout` is dropped.
    pub fn with_close_timeout(channel: RawChannel, close_timeout: Duration) -> Self {
        let RawChannel {
            sink,
            source,
            remote_address,
        } = channel;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            state: AtomicU8::new(ConnectionState::Open as u8),
            connected_at: now,
            last_activity: RwLock::new(now),
            remote_address: remote_address.unwrap_or_else(|| "unknown".to_string()),
            items: RwLock::new(HashMap::new()),
            sink: Mutex::new(sink),
            source: Mutex::new(Some(source)),
            events_tx,
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
            disconnected: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            close_sent: CancellationToken::new(),
            close_sent_at: parking_lot::Mutex::new(None),
            close_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    pub fn idle_time(&self) -> Duration {
        (Utc::now() - self.last_activity())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    /// Hands out the event stream. Only the first caller gets it.
    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    pub fn set_item<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.items.write().insert(key.into(), Arc::new(value));
    }

    pub fn item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.items.read().get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn has_item(&self, key: &str) -> bool {
        self.items.read().contains_key(key)
    }

    pub fn remove_item(&self, key: &str) -> bool {
        self.items.write().remove(key).is_some()
    }

    pub async fn send_text(&self, message: impl Into<String>) -> Result<(), WebSocketError> {
        self.touch();
        self.transmit(Payload::Text(message.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), WebSocketError> {
        self.touch();
        self.transmit(Payload::Binary(data.into())).await
    }

    pub async fn send(&self, payload: Payload) -> Result<(), WebSocketError> {
        self.touch();
        self.transmit(payload).await
    }

    pub async fn send_object<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), WebSocketError> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    /// Sends a heartbeat ping. Unlike the other send paths this does not
    /// count as activity, otherwise pings would keep idle peers alive forever.
    pub(crate) async fn send_ping(&self, text: String) -> Result<(), WebSocketError> {
        self.transmit(Payload::Text(text)).await
    }

    async fn transmit(&self, payload: Payload) -> Result<(), WebSocketError> {
        if !self.is_active() {
            return Err(self.not_sendable());
        }

        // One writer at a time; the channel is not safe for concurrent writes.
        let mut sink = self.sink.lock().await;
        if !self.is_active() {
            return Err(self.not_sendable());
        }

        if let Err(e) = sink.send(payload).await {
            warn!("Send failed on connection {}: {}", self.id, e);
            self.set_state(ConnectionState::Closed);
            return Err(e);
        }
        Ok(())
    }

    fn not_sendable(&self) -> WebSocketError {
        WebSocketError::TransportError(format!(
            "connection {} is not open (state: {:?})",
            self.id,
            self.state()
        ))
    }

    pub async fn close(&self) -> Result<(), WebSocketError> {
        self.close_with(CloseCode::Normal, "connection closed normally").await
    }

    /// Performs the close handshake from our side. No-op unless the
    /// connection is `Open` or `CloseReceived`. When the peer still has to
    /// answer, `Disconnected` is left to the receive loop, which waits at most
    /// the close timeout for the reply.
    pub async fn close_with(&self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        let mut sink = self.sink.lock().await;
        let previous = self.state();
        if !matches!(previous, ConnectionState::Open | ConnectionState::CloseReceived) {
            return Ok(());
        }

        match sink.close(code, reason).await {
            Ok(()) => {
                let next = if previous == ConnectionState::CloseReceived {
                    ConnectionState::Closed
                } else {
                    ConnectionState::CloseSent
                };
                self.set_state(next);
                drop(sink);
                debug!("Connection {} closed with {} ({})", self.id, code.as_u16(), reason);
                if next == ConnectionState::Closed {
                    self.notify_disconnected();
                } else {
                    *self.close_sent_at.lock() = Some(Instant::now());
                    self.close_sent.cancel();
                }
                Ok(())
            }
            Err(e) => {
                self.cancel.cancel();
                self.set_state(ConnectionState::Closed);
                self.notify_disconnected();
                Err(e)
            }
        }
    }

    fn notify_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(ConnectionEvent::Disconnected);
        }
    }

    /// Drives the read half until the connection ends. Inbound messages are
    /// published in arrival order; `Disconnected` is published exactly once.
    pub async fn run_receive_loop(&self) {
        let source = self.source.lock().await.take();
        let Some(mut source) = source else {
            warn!("Receive loop for connection {} already started", self.id);
            return;
        };

        if let Err(e) = self.receive_frames(source.as_mut()).await {
            warn!("Receive loop failed on connection {}: {}", self.id, e);
            if let Err(close_err) = self
                .close_with(CloseCode::InternalError, "internal server error")
                .await
            {
                debug!("Forced close of connection {} failed: {}", self.id, close_err);
            }
        }

        self.set_state(ConnectionState::Closed);
        self.notify_disconnected();
        info!("Receive loop finished for connection {}", self.id);
    }

    /// Resolves once our close frame has gone unanswered for the close timeout.
    async fn close_handshake_expired(&self) {
        self.close_sent.cancelled().await;
        let sent_at = *self.close_sent_at.lock();
        let deadline = sent_at.unwrap_or_else(Instant::now) + self.close_timeout;
        tokio::time::sleep_until(deadline).await;
    }

    async fn receive_frames(&self, source: &mut dyn FrameSource) -> Result<(), WebSocketError> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut current_kind: Option<MessageKind> = None;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = self.close_handshake_expired() => {
                    warn!(
                        "Connection {} did not answer close within {:?}, dropping it",
                        self.id, self.close_timeout
                    );
                    return Ok(());
                }
                frame = source.next_frame() => frame,
            };

            match next {
                None => {
                    debug!("Peer of connection {} went away without closing", self.id);
                    self.set_state(ConnectionState::Closed);
                    return Ok(());
                }
                Some(Err(e)) => {
                    return Err(WebSocketError::InternalLoopFailure(e.to_string()));
                }
                Some(Ok(Frame::Close { code, reason })) => {
                    info!(
                        "Client closed connection {} (code: {:?}, reason: {})",
                        self.id, code, reason
                    );
                    if self.state() == ConnectionState::CloseSent {
                        self.set_state(ConnectionState::Closed);
                    } else {
                        self.set_state(ConnectionState::CloseReceived);
                        if let Err(e) = self.close().await {
                            debug!("Close handshake reply failed on {}: {}", self.id, e);
                        }
                    }
                    return Ok(());
                }
                Some(Ok(Frame::Data {
                    kind,
                    payload,
                    end_of_message,
                })) => {
                    self.touch();
                    let kind = *current_kind.get_or_insert(kind);
                    buffer.extend_from_slice(&payload);
                    if !end_of_message {
                        continue;
                    }

                    current_kind = None;
                    let data = std::mem::take(&mut buffer);
                    let text = match kind {
                        MessageKind::Text => Some(String::from_utf8(data.clone()).map_err(|e| {
                            WebSocketError::InvalidFormat(format!("text frame is not UTF-8: {}", e))
                        })?),
                        MessageKind::Binary => None,
                    };
                    let _ = self
                        .events_tx
                        .send(ConnectionEvent::Message(ReceivedMessage { kind, data, text }));
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote_address", &self.remote_address)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::channel::{memory_channel, PeerFrame};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_new_connection_defaults() {
        let (channel, _peer) = memory_channel(None);
        let connection = Connection::new(channel);

        assert!(connection.is_active());
        assert_eq!(connection.remote_address(), "unknown");
        assert!(!connection.id().is_empty());
        assert!(connection.idle_time() < Duration::from_secs(1));
        assert!(connection.subscribe().is_some());
        assert!(connection.subscribe().is_none());
    }

    #[tokio::test]
    async fn test_send_updates_activity() {
        let (channel, mut peer) = memory_channel(Some("127.0.0.1:9"));
        let connection = Connection::new(channel);
        let before = connection.last_activity();

        tokio::time::sleep(Duration::from_millis(5)).await;
        connection.send_text("hi").await.unwrap();
        connection.send_binary(vec![1, 2, 3]).await.unwrap();
        connection
            .send_object(&serde_json::json!({ "type": "note" }))
            .await
            .unwrap();

        assert!(connection.last_activity() > before);
        assert_eq!(peer.recv().await, Some(PeerFrame::Text("hi".into())));
        assert_eq!(peer.recv().await, Some(PeerFrame::Binary(vec![1, 2, 3])));
        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Text(r#"{"type":"note"}"#.into()))
        );
    }

    #[tokio::test]
    async fn test_failed_send_marks_connection_closed() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Connection::new(channel);
        peer.sever();

        let err = connection.send_text("x").await.unwrap_err();
        assert!(matches!(err, WebSocketError::TransportError(_)));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.send_text("again").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_notifies_once() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Connection::new(channel);
        let mut events = connection.subscribe().unwrap();

        connection.close_with(CloseCode::Normal, "bye").await.unwrap();
        assert_eq!(connection.state(), ConnectionState::CloseSent);
        connection.close().await.unwrap();

        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Close { code: 1000, reason: "bye".into() })
        );
        assert!(peer.try_recv().is_none());
        // Still waiting for the peer's half of the handshake.
        assert!(events.try_recv().is_err());

        // A send after close is a delivery failure, not a panic.
        assert!(connection.send_text("late").await.is_err());

        peer.send_close(CloseCode::Normal, "bye");
        connection.run_receive_loop().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
        assert!(events.try_recv().is_err());
        // No second close frame for the peer-completed handshake.
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_messages_after_server_close_precede_disconnect() {
        let (channel, peer) = memory_channel(None);
        let connection = Connection::new(channel);
        let mut events = connection.subscribe().unwrap();

        connection.close().await.unwrap();
        peer.send_text("late");
        peer.send_close(CloseCode::Normal, "ack");
        connection.run_receive_loop().await;

        match events.recv().await {
            Some(ConnectionEvent::Message(message)) => {
                assert_eq!(message.text.as_deref(), Some("late"));
            }
            other => panic!("expected late message first, got {:?}", other),
        }
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_silent_peer_is_dropped_after_close_timeout() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Arc::new(Connection::with_close_timeout(
            channel,
            Duration::from_millis(50),
        ));
        let mut events = connection.subscribe().unwrap();

        let receive = tokio::spawn({
            let connection = connection.clone();
            async move { connection.run_receive_loop().await }
        });

        connection.close_with(CloseCode::Normal, "connection timeout").await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Close { code: 1000, reason: "connection timeout".into() })
        );

        // The peer never answers.
        tokio::time::timeout(Duration::from_secs(2), receive)
            .await
            .expect("receive loop should give up on a silent peer")
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_timeout_does_not_cut_an_answering_peer() {
        let (channel, peer) = memory_channel(None);
        let connection = Arc::new(Connection::with_close_timeout(
            channel,
            Duration::from_millis(200),
        ));
        let mut events = connection.subscribe().unwrap();

        connection.close().await.unwrap();
        peer.send_close(CloseCode::Normal, "ack");

        let started = std::time::Instant::now();
        connection.run_receive_loop().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_failed_close_cancels_connection() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Connection::new(channel);
        peer.sever();

        assert!(connection.close().await.is_err());
        assert_eq!(connection.state(), ConnectionState::Closed);
        // The cancelled receive loop exits immediately.
        tokio::time::timeout(Duration::from_secs(1), connection.run_receive_loop())
            .await
            .expect("receive loop should observe cancellation");
    }

    #[tokio::test]
    async fn test_receive_loop_reassembles_fragments_in_order() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Arc::new(Connection::new(channel));
        let mut events = connection.subscribe().unwrap();

        peer.send_frame(Frame::Data {
            kind: MessageKind::Text,
            payload: b"hel".to_vec(),
            end_of_message: false,
        });
        peer.send_frame(Frame::Data {
            kind: MessageKind::Text,
            payload: b"lo".to_vec(),
            end_of_message: true,
        });
        peer.send_frame(Frame::binary(vec![9u8; 3]));
        peer.send_close(CloseCode::Normal, "done");

        connection.run_receive_loop().await;

        match events.recv().await {
            Some(ConnectionEvent::Message(message)) => {
                assert_eq!(message.kind, MessageKind::Text);
                assert_eq!(message.text.as_deref(), Some("hello"));
                assert_eq!(message.data, b"hello".to_vec());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await {
            Some(ConnectionEvent::Message(message)) => {
                assert_eq!(message.kind, MessageKind::Binary);
                assert_eq!(message.text, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
        assert!(events.try_recv().is_err());

        // Our half of the handshake went out and the connection is done.
        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Close { code: 1000, reason: "connection closed normally".into() })
        );
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_receive_loop_failure_forces_internal_error_close() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Connection::new(channel);
        let mut events = connection.subscribe().unwrap();

        peer.inject_error("boom");
        connection.run_receive_loop().await;

        assert_eq!(
            peer.recv().await,
            Some(PeerFrame::Close { code: 1011, reason: "internal server error".into() })
        );
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_vanishing_ends_loop() {
        let (channel, mut peer) = memory_channel(None);
        let connection = Connection::new(channel);
        let mut events = connection.subscribe().unwrap();

        peer.sever();
        connection.run_receive_loop().await;

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_items_store() {
        let (channel, _peer) = memory_channel(None);
        let connection = Connection::new(channel);

        connection.set_item("user", String::from("alice"));
        connection.set_item("attempts", 3u32);

        assert_eq!(connection.item::<String>("user").as_deref().map(String::as_str), Some("alice"));
        assert_eq!(connection.item::<u32>("attempts").map(|v| *v), Some(3));
        assert!(connection.item::<u32>("user").is_none());
        assert!(connection.remove_item("user"));
        assert!(!connection.has_item("user"));
        assert!(!connection.remove_item("user"));
    }

    struct SlowSink {
        in_flight: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for SlowSink {
        async fn send(&mut self, _payload: Payload) -> Result<(), WebSocketError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self, _code: CloseCode, _reason: &str) -> Result<(), WebSocketError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_serialized() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (memory, _peer) = memory_channel(None);
        let channel = RawChannel::new(
            Box::new(SlowSink {
                in_flight: in_flight.clone(),
                max_seen: max_seen.clone(),
            }),
            memory.source,
            None,
        );
        let connection = Arc::new(Connection::new(channel));

        let sends = (0..8).map(|i| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send_text(format!("msg {}", i)).await })
        });
        for result in futures::future::join_all(sends).await {
            result.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
