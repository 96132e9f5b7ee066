//! # Device Sessions
//!
//! A session is the live binding between one device and one open WebSocket.
//!
//! ## Session Lifecycle:
//! 1. **Connecting**: transport accepted, waiting for `handshake`
//! 2. **Online**: handshake acknowledged, audio and status messages accepted
//! 3. **Offline**: torn down (terminal, a reconnect builds a new session)
//!
//! - [`manager`]: the single owner of every session and of the device registry
//! - [`server`]: the actor that runs the manager on one event loop and owns the timers

pub mod manager;
pub mod server;

use crate::audio::capture::CaptureSlot;
use crate::device::{Capabilities, DeviceStatus};
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

pub use manager::SessionManager;
pub use server::BridgeServer;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// No handshake within the handshake timeout
    HandshakeTimeout,
    /// No pong within the ping timeout
    Timeout,
    /// The device closed the connection
    ClientClosed,
    /// The WebSocket failed
    TransportError,
    /// A newer connection claimed the same device id
    Replaced,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::HandshakeTimeout => "handshake_timeout",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::Replaced => "replaced",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }
}

/// Identity handed back to a transport when it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub device_id: String,
    pub connection_id: Uuid,
}

/// Live state of one connection.
#[derive(Debug)]
pub struct Session {
    pub device_id: String, // re-keyed when the handshake claims another id
    /// Distinguishes this transport from earlier or later ones of the same device
    pub connection_id: Uuid,
    /// Set by every successful handshake
    pub session_id: Option<String>,
    pub state: DeviceStatus,
    pub connected_at: Instant,
    pub last_ping_at: Instant,
    pub capabilities: Option<Capabilities>,
    pub(crate) capture: CaptureSlot,
    pub(crate) transport: Arc<dyn Transport>,
    /// Held for the whole of one outbound playback
    pub(crate) playback_lock: Arc<Mutex<()>>,
}

impl Session {
    fn new(device_id: String, transport: Arc<dyn Transport>, now: Instant, max_stream_bytes: u64) -> Self {
        Self {
            device_id,
            connection_id: Uuid::new_v4(),
            session_id: None,
            state: DeviceStatus::Connecting,
            connected_at: now,
            last_ping_at: now,
            capabilities: None,
            capture: CaptureSlot::new(max_stream_bytes),
            transport,
            playback_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == DeviceStatus::Online
    }
}
