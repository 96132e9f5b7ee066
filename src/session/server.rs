//! # Bridge Server Actor
//!
//! Runs the [`SessionManager`] inside one actix actor so every connection,
//! timer, and query is handled on a single event loop. Device sockets and HTTP
//! handlers only ever talk to it through messages.
//!
//! ## Timers:
//! - one handshake timer per accepted connection
//! - one liveness interval for all sessions
//!
//! Both die with the actor, so [`Shutdown`] stops them together with every session.

use crate::audio::capture::AudioStreamState;
use crate::audio::playback::{self, PlaybackOptions};
use crate::config::{AppConfig, PlaybackConfig};
use crate::device::{Capabilities, Device};
use crate::events::EventBus;
use crate::protocol::messages::{AudioFormat, ConfigMessage, ServerMessage};
use crate::session::{ConnectionInfo, DisconnectReason, SessionManager};
use crate::transport::Transport;
use actix::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Actor owning all device sessions.
pub struct BridgeServer {
    manager: SessionManager,
    playback: PlaybackConfig,
}

impl BridgeServer {
    pub fn new(config: &AppConfig, bus: EventBus) -> Self {
        Self {
            manager: SessionManager::new(config, bus),
            playback: config.playback.clone(),
        }
    }
}

impl Actor for BridgeServer {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let interval = self.manager.bridge_config().ping_interval();
        info!(ping_interval_ms = interval.as_millis() as u64, "Bridge server started");

        ctx.run_interval(interval, |act, _ctx| {
            let expired = act.manager.check_liveness(Instant::now());
            if !expired.is_empty() {
                debug!(expired = ?expired, "Liveness sweep closed sessions");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Covers the actor stopping without an explicit Shutdown.
        self.manager.shutdown();
        info!("Bridge server stopped");
    }
}

/// A device socket was upgraded.
#[derive(Message)]
#[rtype(result = "Option<ConnectionInfo>")]
pub struct Connect {
    /// Device id from the connection URL, if any
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub transport: Arc<dyn Transport>,
}

/// Something arrived on a device socket.
#[derive(Debug)]
pub enum InboundPayload {
    Text(String),
    Binary(Vec<u8>),
    /// WebSocket-level pong or ping
    Pong,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Inbound {
    pub connection_id: Uuid,
    pub payload: InboundPayload,
}

/// A device socket closed or failed.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub connection_id: Uuid,
    pub reason: DisconnectReason,
}

#[derive(Message)]
#[rtype(result = "Vec<Device>")]
pub struct ListConnected;

#[derive(Message)]
#[rtype(result = "Option<Device>")]
pub struct GetDevice(pub String);

#[derive(Message)]
#[rtype(result = "Option<Capabilities>")]
pub struct GetCapabilities(pub String);

#[derive(Message)]
#[rtype(result = "Option<AudioStreamState>")]
pub struct GetActiveStream(pub String);

/// Number of open sessions, handshaken or not.
#[derive(Message)]
#[rtype(result = "usize")]
pub struct SessionCount;

/// Push a control message to an online device.
#[derive(Message)]
#[rtype(result = "bool")]
pub struct SendToDevice {
    pub device_id: String,
    pub message: ServerMessage,
}

#[derive(Message)]
#[rtype(result = "bool")]
pub struct UpdateDeviceConfig {
    pub device_id: String,
    pub patch: ConfigMessage,
}

/// Stream synthesized audio to a device. Resolves once the last chunk is queued.
///
/// Playbacks to the same device run one after another; a second request waits
/// until the first has queued its last chunk.
#[derive(Message)]
#[rtype(result = "bool")]
pub struct PlayAudio {
    pub device_id: String,
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
}

/// Close every session and stop the actor.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Shutdown;

impl Handler<Connect> for BridgeServer {
    type Result = Option<ConnectionInfo>;

    fn handle(&mut self, msg: Connect, ctx: &mut Self::Context) -> Self::Result {
        let info = self.manager.accept_connection(msg.device_id, msg.ip_address, msg.transport)?;

        let connection_id = info.connection_id;
        ctx.run_later(self.manager.bridge_config().handshake_timeout(), move |act, _ctx| {
            act.manager.expire_handshake(connection_id);
        });

        Some(info)
    }
}

impl Handler<Inbound> for BridgeServer {
    type Result = ();

    fn handle(&mut self, msg: Inbound, _ctx: &mut Self::Context) {
        match msg.payload {
            InboundPayload::Text(text) => self.manager.handle_text(msg.connection_id, &text),
            InboundPayload::Binary(bytes) => self.manager.handle_binary(msg.connection_id, &bytes),
            InboundPayload::Pong => self.manager.handle_native_pong(msg.connection_id),
        }
    }
}

impl Handler<Disconnect> for BridgeServer {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _ctx: &mut Self::Context) {
        self.manager.handle_transport_closed(msg.connection_id, msg.reason);
    }
}

impl Handler<ListConnected> for BridgeServer {
    type Result = MessageResult<ListConnected>;

    fn handle(&mut self, _msg: ListConnected, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.manager.list_connected())
    }
}

impl Handler<GetDevice> for BridgeServer {
    type Result = Option<Device>;

    fn handle(&mut self, msg: GetDevice, _ctx: &mut Self::Context) -> Self::Result {
        self.manager.get_device(&msg.0)
    }
}

impl Handler<GetCapabilities> for BridgeServer {
    type Result = Option<Capabilities>;

    fn handle(&mut self, msg: GetCapabilities, _ctx: &mut Self::Context) -> Self::Result {
        self.manager.get_capabilities(&msg.0)
    }
}

impl Handler<GetActiveStream> for BridgeServer {
    type Result = Option<AudioStreamState>;

    fn handle(&mut self, msg: GetActiveStream, _ctx: &mut Self::Context) -> Self::Result {
        self.manager.get_active_stream(&msg.0)
    }
}

impl Handler<SessionCount> for BridgeServer {
    type Result = usize;

    fn handle(&mut self, _msg: SessionCount, _ctx: &mut Self::Context) -> Self::Result {
        self.manager.session_count()
    }
}

impl Handler<SendToDevice> for BridgeServer {
    type Result = bool;

    fn handle(&mut self, msg: SendToDevice, _ctx: &mut Self::Context) -> Self::Result {
        self.manager.send_message(&msg.device_id, &msg.message)
    }
}

impl Handler<UpdateDeviceConfig> for BridgeServer {
    type Result = bool;

    fn handle(&mut self, msg: UpdateDeviceConfig, _ctx: &mut Self::Context) -> Self::Result {
        self.manager.update_device_config(&msg.device_id, &msg.patch)
    }
}

impl Handler<PlayAudio> for BridgeServer {
    type Result = ResponseFuture<bool>;

    fn handle(&mut self, msg: PlayAudio, _ctx: &mut Self::Context) -> Self::Result {
        // Pacing runs outside the mailbox.
        let target = self.manager.playback_target(&msg.device_id);
        let options = PlaybackOptions::new(&self.playback, msg.format, msg.sample_rate);

        Box::pin(async move {
            match target {
                Some(target) => {
                    let _playing = target.lock.lock().await;
                    playback::send(target.transport.as_ref(), &msg.device_id, &msg.audio, &options).await
                }
                None => {
                    warn!(device_id = %msg.device_id, "Playback requested for device that is not online");
                    false
                }
            }
        })
    }
}

impl Handler<Shutdown> for BridgeServer {
    type Result = ();

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        info!(sessions = self.manager.session_count(), "Bridge shutting down");
        self.manager.shutdown();
        ctx.stop();
    }
}
