//! Transport abstraction underneath a [`Connection`](super::Connection).
//!
//! A [`RawChannel`] is the write half ([`FrameSink`]) and read half
//! ([`FrameSource`]) of one upgraded socket plus the peer address. Adapters
//! exist for `tokio-tungstenite` streams, for `actix-web-actors` sessions (see
//! `websocket::http`) and for an in-process pair used when embedding the core
//! or testing it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::WebSocketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Close status codes used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    PolicyViolation,
    InternalError,
    Other(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::PolicyViolation => 1008,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1008 => CloseCode::PolicyViolation,
            1011 => CloseCode::InternalError,
            other => CloseCode::Other(other),
        }
    }
}

/// One physical frame read from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        kind: MessageKind,
        payload: Vec<u8>,
        end_of_message: bool,
    },
    Close {
        code: Option<u16>,
        reason: String,
    },
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Data {
            kind: MessageKind::Text,
            payload: text.into().into_bytes(),
            end_of_message: true,
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Frame::Data {
            kind: MessageKind::Binary,
            payload: data.into(),
            end_of_message: true,
        }
    }
}

/// A complete outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Payload::Binary(data)
    }
}

/// Write half of a channel. Implementations get `&mut self`, so a sink is
/// never driven by two writers at once.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, payload: Payload) -> Result<(), WebSocketError>;

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError>;
}

/// Read half of a channel. `None` means the peer went away without a close frame.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<Frame, WebSocketError>>;
}

pub struct RawChannel {
    pub(crate) sink: Box<dyn FrameSink>,
    pub(crate) source: Box<dyn FrameSource>,
    pub(crate) remote_address: Option<String>,
}

impl RawChannel {
    pub fn new(
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        remote_address: Option<String>,
    ) -> Self {
        Self {
            sink,
            source,
            remote_address,
        }
    }

    /// Wraps an accepted `tokio-tungstenite` stream.
    pub fn from_tungstenite<S>(stream: WebSocketStream<S>, addr: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = stream.split();
        Self::new(
            Box::new(TungsteniteSink { sink }),
            Box::new(TungsteniteSource { source }),
            addr.map(|a| a.to_string()),
        )
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }
}

struct TungsteniteSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, payload: Payload) -> Result<(), WebSocketError> {
        let message = match payload {
            Payload::Text(text) => Message::Text(text),
            Payload::Binary(data) => Message::Binary(data),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| WebSocketError::TransportError(e.to_string()))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code.as_u16()),
            reason: reason.to_string().into(),
        };
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            // The peer closed first and tungstenite already answered it.
            Err(WsError::ConnectionClosed)
            | Err(WsError::AlreadyClosed)
            | Err(WsError::Protocol(ProtocolError::SendAfterClosing)) => Ok(()),
            Err(e) => Err(WebSocketError::TransportError(e.to_string())),
        }
    }
}

struct TungsteniteSource<S> {
    source: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameSource for TungsteniteSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, WebSocketError>> {
        loop {
            let message = match self.source.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(WebSocketError::TransportError(e.to_string()))),
            };
            // tungstenite reassembles fragments, so every data message is complete.
            return Some(Ok(match message {
                Message::Text(text) => Frame::text(text),
                Message::Binary(data) => Frame::binary(data),
                Message::Close(frame) => Frame::Close {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                },
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }));
        }
    }
}

/// Read half fed from an in-process queue.
pub(crate) struct QueueSource {
    rx: mpsc::UnboundedReceiver<Result<Frame, WebSocketError>>,
}

impl QueueSource {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<Frame, WebSocketError>>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl FrameSource for QueueSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, WebSocketError>> {
        self.rx.recv().await
    }
}

/// What the remote end of a [`memory_channel`] observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

struct MemorySink {
    tx: mpsc::UnboundedSender<PeerFrame>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, payload: Payload) -> Result<(), WebSocketError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(WebSocketError::TransportError("connection reset by peer".into()));
        }
        let frame = match payload {
            Payload::Text(text) => PeerFrame::Text(text),
            Payload::Binary(data) => PeerFrame::Binary(data),
        };
        self.tx
            .send(frame)
            .map_err(|_| WebSocketError::TransportError("peer dropped".into()))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(WebSocketError::TransportError("connection reset by peer".into()));
        }
        self.tx
            .send(PeerFrame::Close {
                code: code.as_u16(),
                reason: reason.to_string(),
            })
            .map_err(|_| WebSocketError::TransportError("peer dropped".into()))
    }
}

/// Remote end of an in-process channel.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<Frame, WebSocketError>>>,
    outbound: mpsc::UnboundedReceiver<PeerFrame>,
    alive: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Queues a frame for the server side to read. Returns false once severed.
    pub fn send_frame(&self, frame: Frame) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send_frame(Frame::text(text))
    }

    pub fn send_close(&self, code: CloseCode, reason: &str) -> bool {
        self.send_frame(Frame::Close {
            code: Some(code.as_u16()),
            reason: reason.to_string(),
        })
    }

    /// Makes the server side's next read fail with a transport error.
    pub fn inject_error(&self, message: &str) -> bool {
        match &self.inbound {
            Some(tx) => tx
                .send(Err(WebSocketError::TransportError(message.to_string())))
                .is_ok(),
            None => false,
        }
    }

    /// Drops the link without a close handshake: writes start failing and
    /// the server's reader sees end of stream.
    pub fn sever(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.inbound = None;
    }

    pub async fn recv(&mut self) -> Option<PeerFrame> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PeerFrame> {
        self.outbound.try_recv().ok()
    }
}

/// Builds a connected in-process channel and its remote end.
pub fn memory_channel(remote_address: Option<&str>) -> (RawChannel, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let alive = Arc::new(AtomicBool::new(true));

    let channel = RawChannel::new(
        Box::new(MemorySink {
            tx: out_tx,
            alive: alive.clone(),
        }),
        Box::new(QueueSource::new(in_rx)),
        remote_address.map(str::to_string),
    );
    let peer = MemoryPeer {
        inbound: Some(in_tx),
        outbound: out_rx,
        alive,
    };
    (channel, peer)
}
