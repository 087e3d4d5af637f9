//! actix-web side of the upgrade adapter.
//!
//! [`websocket_gate`] sits in the middleware chain. Requests for a path in the
//! route table are upgraded into a [`WebSocketSession`] actor and handed to
//! [`WebSocketServer::serve`](super::WebSocketServer::serve); everything else
//! continues down the pipeline untouched.

use actix::prelude::*;
use actix_web::body::{EitherBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{self, HeaderMap};
use actix_web::middleware::Next;
use actix_web::{web, FromRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::channel::{CloseCode, Frame, FrameSink, Payload, QueueSource, RawChannel};
use crate::error::WebSocketError;
use crate::AppState;

type InboundTx = mpsc::UnboundedSender<Result<Frame, WebSocketError>>;

pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub async fn websocket_gate<B: MessageBody + 'static>(
    req: ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<EitherBody<B>>, actix_web::Error> {
    let server = match req.app_data::<web::Data<AppState>>() {
        Some(state) => state.ws_server.clone(),
        None => return Ok(next.call(req).await?.map_into_left_body()),
    };

    let path = req.path().to_string();
    if !server.routes().has_route(&path) {
        return Ok(next.call(req).await?.map_into_left_body());
    }

    if !is_upgrade_request(req.headers()) {
        warn!("Rejected non-upgrade request to WebSocket path {}", path);
        let response = HttpResponse::BadRequest().json(json!({
            "error": {
                "status": 400,
                "message": format!("{} only accepts WebSocket upgrades", path)
            }
        }));
        return Ok(req.into_response(response).map_into_right_body());
    }

    let (http_req, mut dev_payload) = req.into_parts();
    let body = web::Payload::from_request(&http_req, &mut dev_payload).await?;

    let peer_addr = http_req
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!("New WebSocket connection request on {} from {}", path, peer_addr);

    let (tx, rx) = mpsc::unbounded_channel();
    let session = WebSocketSession::new(peer_addr.clone(), tx);
    let (addr, response) = ws::WsResponseBuilder::new(session, &http_req, body).start_with_addr()?;

    let channel = RawChannel::new(
        Box::new(SessionSink { addr }),
        Box::new(QueueSource::new(rx)),
        Some(peer_addr),
    );
    actix_rt::spawn(async move {
        // serve logs and cleans up its own failures
        let _ = server.serve(&path, channel).await;
    });

    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
}

/// Outbound instruction for a session actor.
#[derive(Message)]
#[rtype(result = "()")]
enum Outbound {
    Send(Payload),
    Close(CloseCode, String),
    /// The connection is gone; tear the socket down.
    Stop,
}

/// Actor owning one upgraded actix socket. Inbound frames are forwarded to
/// the connection's read queue; writes arrive as [`Outbound`] messages.
struct WebSocketSession {
    peer_addr: String,
    inbound: Option<InboundTx>,
    close_received: bool,
}

impl WebSocketSession {
    fn new(peer_addr: String, inbound: InboundTx) -> Self {
        Self {
            peer_addr,
            inbound: Some(inbound),
            close_received: false,
        }
    }

    fn forward(&mut self, frame: Result<Frame, WebSocketError>) {
        let delivered = self
            .inbound
            .as_ref()
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false);
        if !delivered {
            self.inbound = None;
        }
    }
}

impl Actor for WebSocketSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        debug!("WebSocket session started for {}", self.peer_addr);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender ends the connection's receive loop.
        self.inbound = None;
        info!("WebSocket session closed with {}", self.peer_addr);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WebSocketSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Text(text)) => self.forward(Ok(Frame::text(text.to_string()))),
            Ok(ws::Message::Binary(bin)) => self.forward(Ok(Frame::binary(bin.to_vec()))),
            // WsStream reassembles continuation frames before they get here.
            Ok(ws::Message::Continuation(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed from {}: {:?}", self.peer_addr, reason);
                self.close_received = true;
                let code = reason.as_ref().map(|r| u16::from(r.code));
                let reason = reason.and_then(|r| r.description).unwrap_or_default();
                self.forward(Ok(Frame::Close { code, reason }));
            }
            Err(e) => {
                error!("Error handling WebSocket message from {}: {}", self.peer_addr, e);
                self.forward(Err(WebSocketError::TransportError(e.to_string())));
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for WebSocketSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Send(Payload::Text(text)) => ctx.text(text),
            Outbound::Send(Payload::Binary(data)) => ctx.binary(data),
            Outbound::Close(code, reason) => {
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::from(code.as_u16()),
                    description: Some(reason),
                }));
                // Our reply completes a peer-initiated handshake.
                if self.close_received {
                    ctx.stop();
                }
            }
            Outbound::Stop => ctx.stop(),
        }
    }
}

struct SessionSink {
    addr: Addr<WebSocketSession>,
}

impl Drop for SessionSink {
    fn drop(&mut self) {
        self.addr.do_send(Outbound::Stop);
    }
}

#[async_trait]
impl FrameSink for SessionSink {
    async fn send(&mut self, payload: Payload) -> Result<(), WebSocketError> {
        self.addr
            .send(Outbound::Send(payload))
            .await
            .map_err(|e| WebSocketError::TransportError(format!("session closed: {}", e)))
    }

    async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WebSocketError> {
        self.addr
            .send(Outbound::Close(code, reason.to_string()))
            .await
            .map_err(|e| WebSocketError::TransportError(format!("session closed: {}", e)))
    }
}
