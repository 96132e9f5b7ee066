//! # Device WebSocket Handler
//!
//! Devices connect to the configured WebSocket path (`/ws/esp32` by default),
//! optionally identifying themselves with `?id=<deviceId>`.
//!
//! ## Connection Flow:
//! 1. **Upgrade**: the HTTP request becomes a [`DeviceSocket`] actor
//! 2. **Register**: the actor hands a [`SocketTransport`] to the bridge and gets a connection id
//! 3. **Forward**: every text, binary, and pong frame goes to the bridge tagged with that id
//! 4. **Close**: the bridge closes the socket through the transport, or the
//!    socket reports its own close back to the bridge
//!
//! The actor holds no protocol state. Handshake, audio, and liveness all live
//! in the bridge.

use crate::session::server::{BridgeServer, Connect, Disconnect, Inbound, InboundPayload};
use crate::session::DisconnectReason;
use crate::state::AppState;
use crate::transport::Transport;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Query parameters accepted on the device endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Device id; generated by the bridge when absent
    pub id: Option<String>,
}

/// Outbound traffic queued on a socket actor.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close(String),
}

/// [`Transport`] handed to the bridge for one socket.
///
/// Sends are mailbox hand-offs to the socket actor, so they never block the bridge.
pub struct SocketTransport {
    addr: Addr<DeviceSocket>,
    open: Arc<AtomicBool>,
}

impl SocketTransport {
    fn deliver(&self, msg: Outbound) -> bool {
        if !self.is_open() {
            return false;
        }
        self.addr.do_send(msg);
        true
    }
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport")
            .field("open", &self.is_open())
            .finish()
    }
}

impl Transport for SocketTransport {
    fn send_text(&self, text: String) -> bool {
        self.deliver(Outbound::Text(text))
    }

    fn send_binary(&self, data: Vec<u8>) -> bool {
        self.deliver(Outbound::Binary(data))
    }

    fn close(&self, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.addr.do_send(Outbound::Close(reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.addr.connected()
    }
}

/// WebSocket actor for one device connection.
pub struct DeviceSocket {
    bridge: Addr<BridgeServer>,
    requested_id: Option<String>,
    ip_address: Option<String>,
    /// Set once the bridge accepted the connection
    connection_id: Option<Uuid>,
    open: Arc<AtomicBool>,
    /// Reason recorded when the socket ends on its own
    close_reason: DisconnectReason,
}

impl DeviceSocket {
    pub fn new(bridge: Addr<BridgeServer>, requested_id: Option<String>, ip_address: Option<String>) -> Self {
        Self {
            bridge,
            requested_id,
            ip_address,
            connection_id: None,
            open: Arc::new(AtomicBool::new(true)),
            close_reason: DisconnectReason::ClientClosed,
        }
    }

    fn forward(&self, payload: InboundPayload) {
        if let Some(connection_id) = self.connection_id {
            self.bridge.do_send(Inbound { connection_id, payload });
        }
    }
}

impl Actor for DeviceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let transport = SocketTransport {
            addr: ctx.address(),
            open: self.open.clone(),
        };

        // Hold inbound frames until the bridge has assigned a connection id.
        self.bridge
            .send(Connect {
                device_id: self.requested_id.clone(),
                ip_address: self.ip_address.clone(),
                transport: Arc::new(transport),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                match res {
                    Ok(Some(info)) => {
                        debug!(device_id = %info.device_id, connection_id = %info.connection_id, "Socket registered");
                        act.connection_id = Some(info.connection_id);
                    }
                    Ok(None) => {
                        info!("Bridge refused connection");
                        ctx.stop();
                    }
                    Err(err) => {
                        error!("Bridge unavailable: {}", err);
                        ctx.stop();
                    }
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(connection_id) = self.connection_id.take() {
            self.bridge.do_send(Disconnect {
                connection_id,
                reason: self.close_reason,
            });
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DeviceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(InboundPayload::Text(text.to_string()));
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(InboundPayload::Binary(data.to_vec()));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.forward(InboundPayload::Pong);
            }
            Ok(ws::Message::Pong(_)) => {
                self.forward(InboundPayload::Pong);
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("Device closed socket: {:?}", reason);
                self.close_reason = DisconnectReason::ClientClosed;
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("WebSocket protocol error: {}", err);
                self.close_reason = DisconnectReason::TransportError;
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        // Stream ended without a close frame.
        ctx.stop();
    }
}

impl Handler<Outbound> for DeviceSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg {
            Outbound::Text(text) => ctx.text(text),
            Outbound::Binary(data) => ctx.binary(data),
            Outbound::Close(reason) => {
                // The bridge already tore the session down.
                self.connection_id = None;
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Normal,
                    description: Some(reason),
                }));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the request and starts a [`DeviceSocket`] bound to the bridge.
pub async fn device_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let ip_address = req.peer_addr().map(|addr| addr.ip().to_string());
    info!(
        device_id = query.id.as_deref().unwrap_or("<unassigned>"),
        ip_address = ip_address.as_deref().unwrap_or("unknown"),
        "New device connection request"
    );

    let socket = DeviceSocket::new(app_state.bridge.clone(), query.into_inner().id, ip_address);
    ws::start(socket, &req, stream)
}
