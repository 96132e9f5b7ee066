//! # Session Manager
//!
//! Single authority over device connections: accepts transports, runs the
//! handshake, dispatches every inbound message, sweeps liveness, and tears
//! sessions down.
//!
//! The manager is plain synchronous state. It is driven by
//! [`BridgeServer`](super::server::BridgeServer), which processes one message
//! at a time, so nothing in here needs a lock.
//!
//! ## Inbound Routing:
//! Transports talk to the manager through their connection id, never the
//! device id. A handshake may re-key a session to another device id, and a
//! socket that closes after its device reconnected must not touch the newer
//! session; both fall out of routing by connection id.

use crate::audio::capture::{AudioStreamState, CaptureError};
use crate::config::{AppConfig, BridgeConfig, VadConfig};
use crate::device::{Capabilities, Device, DeviceConfig, DeviceRegistry, DeviceStatus};
use crate::events::{BridgeEvent, EventBus};
use crate::protocol::frame::{self, FrameType};
use crate::protocol::messages::{
    ConfigMessage, DeviceErrorReport, DeviceMessage, Handshake, HandshakeAck, MessageError, ServerMessage,
};
use crate::session::{ConnectionInfo, DisconnectReason, Session};
use crate::transport::Transport;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where one outbound playback goes, and the per-device lock that keeps two
/// playbacks from interleaving on the same socket.
pub struct PlaybackTarget {
    pub transport: Arc<dyn Transport>,
    pub lock: Arc<Mutex<()>>,
}

/// Owns every session, the device registry, and the event bus handle.
pub struct SessionManager {
    config: BridgeConfig,
    vad: VadConfig,
    device_defaults: DeviceConfig,
    /// Sessions by device id
    sessions: HashMap<String, Session>,
    /// Device id by connection id
    connections: HashMap<Uuid, String>,
    registry: DeviceRegistry,
    bus: EventBus,
    shutting_down: bool,
}

impl SessionManager {
    pub fn new(config: &AppConfig, bus: EventBus) -> Self {
        Self {
            config: config.bridge.clone(),
            vad: config.vad.clone(),
            device_defaults: config.device_defaults.to_device_config(),
            sessions: HashMap::new(),
            connections: HashMap::new(),
            registry: DeviceRegistry::new(),
            bus,
            shutting_down: false,
        }
    }

    pub fn bridge_config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Register a new transport in the `connecting` state.
    ///
    /// A device id is generated when the connection did not supply one. An
    /// existing session for the same id is closed as `replaced`. Returns None
    /// (and closes the transport) once shutdown has begun.
    pub fn accept_connection(
        &mut self,
        supplied_id: Option<String>,
        ip_address: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Option<ConnectionInfo> {
        if self.shutting_down {
            transport.close(DisconnectReason::ServerShutdown.as_str());
            return None;
        }

        let device_id = supplied_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_device_id);

        if self.sessions.contains_key(&device_id) {
            info!(device_id = %device_id, "Device reconnected, replacing previous session");
            self.close_connection(&device_id, DisconnectReason::Replaced);
        }

        let session = Session::new(device_id.clone(), transport, Instant::now(), self.config.max_stream_bytes);
        let connection_id = session.connection_id;

        self.registry.insert(Device::new(
            device_id.clone(),
            ip_address.clone(),
            self.device_defaults.clone(),
        ));
        self.connections.insert(connection_id, device_id.clone());
        self.sessions.insert(device_id.clone(), session);

        info!(
            device_id = %device_id,
            connection_id = %connection_id,
            ip_address = ip_address.as_deref().unwrap_or("unknown"),
            "Device connection accepted, awaiting handshake"
        );

        Some(ConnectionInfo {
            device_id,
            connection_id,
        })
    }

    /// Dispatch one JSON text message.
    pub fn handle_text(&mut self, connection_id: Uuid, text: &str) {
        let Some(device_id) = self.resolve(connection_id) else {
            return;
        };

        match DeviceMessage::parse(text) {
            Ok(message) => {
                debug!(device_id = %device_id, kind = message.kind(), "Received message");
                self.dispatch(&device_id, connection_id, message);
            }
            Err(MessageError::UnknownType(kind)) => {
                warn!(device_id = %device_id, kind = %kind, "Ignoring unknown message type");
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Dropping malformed message");
                self.send_to(&device_id, &ServerMessage::error(e.code(), e.to_string()));
            }
        }
    }

    /// Dispatch one binary message.
    pub fn handle_binary(&mut self, connection_id: Uuid, bytes: &[u8]) {
        let Some(device_id) = self.resolve(connection_id) else {
            return;
        };

        let frame = match frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(device_id = %device_id, len = bytes.len(), error = %e, "Dropping undecodable frame");
                return;
            }
        };

        if frame.frame_type != FrameType::AudioData {
            warn!(device_id = %device_id, frame_type = ?frame.frame_type, "Dropping frame not valid from a device");
            return;
        }

        let Some(session) = self.sessions.get_mut(&device_id) else {
            return;
        };
        match session.capture.ingest(frame.payload, &self.bus) {
            Ok(_) => {}
            Err(CaptureError::TooLarge { stream_id, limit }) => {
                warn!(device_id = %device_id, stream_id = %stream_id, limit, "Audio stream exceeded size limit");
                let report = DeviceErrorReport {
                    code: "stream_too_large".to_string(),
                    message: format!("audio stream {} exceeded {} bytes", stream_id, limit),
                    details: Some(json!({ "streamId": stream_id, "limit": limit })),
                };
                self.send_to(&device_id, &ServerMessage::error(&report.code, &report.message));
                self.bus.emit(BridgeEvent::DeviceError {
                    device_id,
                    error: report,
                });
            }
            Err(e) => {
                warn!(device_id = %device_id, bytes = frame.payload.len(), error = %e, "Dropping audio frame");
            }
        }
    }

    /// A WebSocket-level pong (or ping) arrived.
    pub fn handle_native_pong(&mut self, connection_id: Uuid) {
        if let Some(device_id) = self.resolve(connection_id) {
            self.record_pong(&device_id);
        }
    }

    /// The transport went away on its own.
    pub fn handle_transport_closed(&mut self, connection_id: Uuid, reason: DisconnectReason) {
        if let Some(device_id) = self.resolve(connection_id) {
            self.close_connection(&device_id, reason);
        }
    }

    /// Handshake timer fired: close the connection if it never completed a
    /// handshake. Returns true if it was closed.
    pub fn expire_handshake(&mut self, connection_id: Uuid) -> bool {
        let Some(device_id) = self.connections.get(&connection_id).cloned() else {
            return false;
        };
        let still_connecting = self
            .sessions
            .get(&device_id)
            .map(|s| s.state == DeviceStatus::Connecting)
            .unwrap_or(false);

        if still_connecting {
            warn!(device_id = %device_id, "Handshake timeout");
            self.close_connection(&device_id, DisconnectReason::HandshakeTimeout)
        } else {
            false
        }
    }

    /// One liveness sweep: close sessions silent for longer than the ping
    /// timeout, ping the rest. Returns the ids that were closed.
    pub fn check_liveness(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.config.ping_timeout();

        let mut expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_ping_at) > timeout)
            .map(|s| s.device_id.clone())
            .collect();
        expired.sort();

        for device_id in &expired {
            warn!(device_id = %device_id, timeout_ms = self.config.ping_timeout_ms, "Ping timeout");
            self.close_connection(device_id, DisconnectReason::Timeout);
        }

        if !self.shutting_down {
            if let Ok(ping) = ServerMessage::Ping.to_json() {
                for session in self.sessions.values() {
                    if session.transport.is_open() {
                        session.transport.send_text(ping.clone());
                    }
                }
            }
        }

        expired
    }

    /// Tear a session down. Returns false if there was no such session.
    pub fn close_connection(&mut self, device_id: &str, reason: DisconnectReason) -> bool {
        let Some(mut session) = self.sessions.remove(device_id) else {
            return false;
        };
        self.connections.remove(&session.connection_id);

        if let Some(stream) = session.capture.cancel() {
            info!(
                device_id = %device_id,
                stream_id = %stream.stream_id,
                "Cancelled audio stream on disconnect"
            );
        }

        // Offline devices leave the live set; subscribers get the final snapshot.
        let device = self.registry.remove(device_id).map(|mut device| {
            device.status = DeviceStatus::Offline;
            device.touch();
            device
        });

        if session.transport.is_open() {
            session.transport.close(reason.as_str());
        }

        info!(
            device_id = %device_id,
            reason = reason.as_str(),
            was = session.state.as_str(),
            connected_secs = session.connected_at.elapsed().as_secs(),
            "Device disconnected"
        );

        self.bus.emit(BridgeEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            reason,
            device,
        });
        true
    }

    /// Close every session. Nothing is sent afterwards.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let mut device_ids: Vec<String> = self.sessions.keys().cloned().collect();
        device_ids.sort();
        info!(sessions = device_ids.len(), "Closing all device sessions");

        for device_id in device_ids {
            self.close_connection(&device_id, DisconnectReason::ServerShutdown);
        }
    }

    /// Send a message to an online device.
    pub fn send_message(&self, device_id: &str, message: &ServerMessage) -> bool {
        match self.sessions.get(device_id) {
            Some(session) if session.is_online() => self.send_to(device_id, message),
            _ => {
                debug!(device_id = %device_id, "Not sending to device without an online session");
                false
            }
        }
    }

    /// Merge a partial config into the device entry and push the result.
    pub fn update_device_config(&mut self, device_id: &str, patch: &ConfigMessage) -> bool {
        if !self.registry.is_connected(device_id) {
            return false;
        }
        let Some(device) = self.registry.get_mut(device_id) else {
            return false;
        };

        device.config.apply(patch);
        let mut message = ConfigMessage::from_device_config(&device.config, self.vad.threshold, self.vad.silence_timeout_ms);
        if patch.vad_threshold.is_some() {
            message.vad_threshold = patch.vad_threshold;
        }
        if patch.silence_timeout.is_some() {
            message.silence_timeout = patch.silence_timeout;
        }

        info!(device_id = %device_id, "Pushing device config");
        self.send_to(device_id, &ServerMessage::Config(message))
    }

    /// Transport to stream playback audio to, if the device is online.
    pub fn playback_target(&self, device_id: &str) -> Option<PlaybackTarget> {
        if self.shutting_down {
            return None;
        }
        self.sessions
            .get(device_id)
            .filter(|s| s.is_online())
            .map(|s| PlaybackTarget {
                transport: s.transport.clone(),
                lock: s.playback_lock.clone(),
            })
    }

    pub fn list_connected(&self) -> Vec<Device> {
        self.registry.list_connected()
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id).cloned()
    }

    pub fn get_capabilities(&self, device_id: &str) -> Option<Capabilities> {
        self.registry.get_capabilities(device_id)
    }

    pub fn get_active_stream(&self, device_id: &str) -> Option<AudioStreamState> {
        self.sessions
            .get(device_id)
            .and_then(|s| s.capture.active().cloned())
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.registry.is_connected(device_id)
    }

    pub fn session(&self, device_id: &str) -> Option<&Session> {
        self.sessions.get(device_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn resolve(&self, connection_id: Uuid) -> Option<String> {
        let device_id = self.connections.get(&connection_id).cloned();
        if device_id.is_none() {
            debug!(connection_id = %connection_id, "Ignoring message from closed connection");
        }
        device_id
    }

    fn dispatch(&mut self, device_id: &str, connection_id: Uuid, message: DeviceMessage) {
        let online = self
            .sessions
            .get(device_id)
            .map(|s| s.is_online())
            .unwrap_or(false);

        match message {
            DeviceMessage::Handshake(handshake) => self.on_handshake(device_id, connection_id, handshake),
            DeviceMessage::Pong(_) => self.record_pong(device_id),
            DeviceMessage::Error(report) => self.on_device_error(device_id, report),
            other if !online => {
                warn!(device_id = %device_id, kind = other.kind(), "Message before handshake");
                self.send_to(
                    device_id,
                    &ServerMessage::error("handshake_required", "Send a handshake before other messages"),
                );
            }
            DeviceMessage::AudioStart(start) => {
                if let Some(session) = self.sessions.get_mut(device_id) {
                    session.capture.start(device_id, &start, &self.bus);
                }
            }
            DeviceMessage::AudioChunk(meta) => {
                if let Some(session) = self.sessions.get_mut(device_id) {
                    if let Err(e) = session.capture.chunk_meta(&meta) {
                        warn!(device_id = %device_id, stream_id = %meta.stream_id, error = %e, "Ignoring audio_chunk");
                    }
                }
            }
            DeviceMessage::AudioEnd(end) => {
                if let Some(session) = self.sessions.get_mut(device_id) {
                    if let Err(e) = session.capture.end(&end, &self.bus) {
                        warn!(device_id = %device_id, stream_id = %end.stream_id, error = %e, "Ignoring audio_end");
                    }
                }
            }
            DeviceMessage::Status(report) => {
                if let Some(device) = self.registry.get_mut(device_id) {
                    device.touch();
                    device.last_status = Some(report.clone());
                }
                debug!(device_id = %device_id, status = %report.status, "Device status");
                self.bus.emit(BridgeEvent::DeviceStatus {
                    device_id: device_id.to_string(),
                    report,
                });
            }
        }
    }

    fn on_handshake(&mut self, device_id: &str, connection_id: Uuid, handshake: Handshake) {
        let claimed = handshake.device_id.trim();
        let device_id = if !claimed.is_empty() && claimed != device_id {
            self.rekey(device_id, claimed, connection_id);
            claimed.to_string()
        } else {
            device_id.to_string()
        };

        let Some(session) = self.sessions.get_mut(&device_id) else {
            return;
        };
        let Some(device) = self.registry.get_mut(&device_id) else {
            error!(device_id = %device_id, "Session without registry entry");
            return;
        };

        let session_id = Uuid::new_v4().to_string();
        session.state = DeviceStatus::Online;
        session.session_id = Some(session_id.clone());
        session.capabilities = handshake.capabilities.clone();
        session.last_ping_at = Instant::now();

        device.status = DeviceStatus::Online;
        device.mac_address = handshake.mac_address.clone().or(device.mac_address.take());
        device.firmware_version = handshake.firmware_version.clone().or(device.firmware_version.take());
        if let Some(name) = handshake.device_name.as_ref().filter(|n| !n.is_empty()) {
            device.display_name = name.clone();
        }
        device.capabilities = handshake.capabilities;
        device.touch();

        let ack = ServerMessage::HandshakeAck(HandshakeAck {
            success: true,
            session_id: session_id.clone(),
            server_time: Utc::now().timestamp_millis(),
            config: Some(ConfigMessage::from_device_config(
                &device.config,
                self.vad.threshold,
                self.vad.silence_timeout_ms,
            )),
        });
        let device = device.clone();

        info!(
            device_id = %device_id,
            session_id = %session_id,
            firmware = device.firmware_version.as_deref().unwrap_or("unknown"),
            "Handshake complete"
        );

        self.send_to(&device_id, &ack);
        self.bus.emit(BridgeEvent::DeviceConnected { device, session_id });
    }

    /// Move a session from the connection-supplied id to the id the device
    /// claims in its handshake.
    fn rekey(&mut self, from: &str, to: &str, connection_id: Uuid) {
        if self.sessions.contains_key(to) {
            info!(device_id = %to, "Handshake claims id of a connected device, replacing it");
            self.close_connection(to, DisconnectReason::Replaced);
        }

        let Some(mut session) = self.sessions.remove(from) else {
            return;
        };
        if let Some(stream) = session.capture.cancel() {
            debug!(stream_id = %stream.stream_id, "Cancelled audio stream on device re-key");
        }
        session.device_id = to.to_string();
        self.sessions.insert(to.to_string(), session);
        self.connections.insert(connection_id, to.to_string());

        if let Some(mut device) = self.registry.remove(from) {
            device.id = to.to_string();
            if device.display_name == from {
                device.display_name = to.to_string();
            }
            self.registry.insert(device);
        }

        info!(from = %from, to = %to, "Session re-keyed to handshake device id");
    }

    fn record_pong(&mut self, device_id: &str) {
        if let Some(session) = self.sessions.get_mut(device_id) {
            session.last_ping_at = Instant::now();
        }
        if let Some(device) = self.registry.get_mut(device_id) {
            device.touch();
        }
    }

    fn on_device_error(&mut self, device_id: &str, report: DeviceErrorReport) {
        warn!(
            device_id = %device_id,
            code = %report.code,
            message = %report.message,
            "Device reported error"
        );

        // An error naming the active recording ends that recording.
        let stream_id = report
            .details
            .as_ref()
            .and_then(|d| d.get("streamId"))
            .and_then(|v| v.as_str());
        if let (Some(stream_id), Some(session)) = (stream_id, self.sessions.get_mut(device_id)) {
            if session.capture.active().map(|s| s.stream_id == stream_id).unwrap_or(false) {
                session.capture.fail();
            }
        }

        self.bus.emit(BridgeEvent::DeviceError {
            device_id: device_id.to_string(),
            error: report,
        });
    }

    fn send_to(&self, device_id: &str, message: &ServerMessage) -> bool {
        if self.shutting_down {
            return false;
        }
        let Some(session) = self.sessions.get(device_id) else {
            return false;
        };
        if !session.transport.is_open() {
            return false;
        }
        match message.to_json() {
            Ok(json) => session.transport.send_text(json),
            Err(e) => {
                error!(device_id = %device_id, error = %e, "Failed to serialize outbound message");
                false
            }
        }
    }
}

fn generate_device_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("esp32-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::capture::StreamStatus;
    use crate::transport::testing::RecordingTransport;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn manager() -> (SessionManager, broadcast::Receiver<BridgeEvent>) {
        manager_with(&AppConfig::default())
    }

    fn manager_with(config: &AppConfig) -> (SessionManager, broadcast::Receiver<BridgeEvent>) {
        let bus = EventBus::new(config.bridge.event_capacity);
        let rx = bus.subscribe();
        (SessionManager::new(config, bus), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[BridgeEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name()).collect()
    }

    fn handshake_json(device_id: &str) -> String {
        json!({
            "type": "handshake",
            "timestamp": 1,
            "deviceId": device_id,
            "macAddress": "AA:BB:CC:DD:EE:01",
            "firmwareVersion": "1.0.0",
            "capabilities": {"hasMicrophone": true, "hasSpeaker": true, "supportedFormats": ["pcm16"]}
        })
        .to_string()
    }

    fn connect(m: &mut SessionManager, id: &str) -> (Uuid, Arc<RecordingTransport>) {
        let transport = RecordingTransport::new();
        let info = m
            .accept_connection(Some(id.to_string()), Some("10.0.0.2".to_string()), transport.clone())
            .unwrap();
        (info.connection_id, transport)
    }

    fn connect_online(m: &mut SessionManager, id: &str) -> (Uuid, Arc<RecordingTransport>) {
        let (conn, transport) = connect(m, id);
        m.handle_text(conn, &handshake_json(id));
        (conn, transport)
    }

    #[test]
    fn test_handshake_scenario() {
        let (mut m, mut rx) = manager();
        let (conn, transport) = connect(&mut m, "esp-1");
        assert!(m.list_connected().is_empty());
        assert_eq!(m.session("esp-1").unwrap().state, DeviceStatus::Connecting);

        m.handle_text(conn, &handshake_json("esp-1"));

        let acks = transport.texts_of("handshake_ack");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["success"], true);
        let session_id = acks[0]["sessionId"].as_str().unwrap();
        assert!(Uuid::parse_str(session_id).is_ok());
        assert_eq!(acks[0]["config"]["wakeWord"], "hey bot");
        assert_eq!(acks[0]["config"]["vadThreshold"], 0.5);
        assert!(acks[0]["serverTime"].as_i64().unwrap() > 0);

        let connected = m.list_connected();
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].id, "esp-1");
        assert_eq!(connected[0].status, DeviceStatus::Online);
        assert_eq!(connected[0].mac_address.as_deref(), Some("AA:BB:CC:DD:EE:01"));
        assert_eq!(connected[0].ip_address.as_deref(), Some("10.0.0.2"));
        assert!(m.is_connected("esp-1"));
        assert!(m.get_capabilities("esp-1").unwrap().has_microphone);

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["device:connected"]);
        match &events[0] {
            BridgeEvent::DeviceConnected { session_id: sid, device } => {
                assert_eq!(sid, session_id);
                assert_eq!(device.firmware_version.as_deref(), Some("1.0.0"));
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_session_id_changes_on_every_handshake() {
        let (mut m, _rx) = manager();
        let (conn, transport) = connect_online(&mut m, "esp-1");
        m.handle_text(conn, &handshake_json("esp-1"));

        let acks = transport.texts_of("handshake_ack");
        assert_eq!(acks.len(), 2);
        assert_ne!(acks[0]["sessionId"], acks[1]["sessionId"]);

        let (_, transport2) = connect_online(&mut m, "esp-1");
        assert_eq!(transport.close_reason().as_deref(), Some("replaced"));
        assert_ne!(transport2.texts_of("handshake_ack")[0]["sessionId"], acks[1]["sessionId"]);
        assert_eq!(m.session_count(), 1);
    }

    #[test]
    fn test_generated_id_and_rekey_on_handshake() {
        let (mut m, _rx) = manager();
        let transport = RecordingTransport::new();
        let info = m.accept_connection(None, None, transport.clone()).unwrap();
        assert!(info.device_id.starts_with("esp32-"));

        m.handle_text(info.connection_id, &handshake_json("esp-7"));

        assert!(m.get_device(&info.device_id).is_none());
        assert!(m.is_connected("esp-7"));
        assert_eq!(m.session("esp-7").unwrap().connection_id, info.connection_id);

        // Later traffic on the same connection reaches the re-keyed session.
        m.handle_text(info.connection_id, r#"{"type":"status","status":"idle","batteryLevel":80}"#);
        assert_eq!(m.get_device("esp-7").unwrap().last_status.unwrap().battery_level, Some(80));
    }

    #[test]
    fn test_capture_scenario_three_frames() {
        let (mut m, mut rx) = manager();
        let (conn, _transport) = connect_online(&mut m, "esp-1");
        drain(&mut rx);

        m.handle_text(
            conn,
            r#"{"type":"audio_start","streamId":"s1","format":"pcm16","sampleRate":16000,"channels":1}"#,
        );
        assert_eq!(m.get_active_stream("esp-1").unwrap().stream_id, "s1");

        for i in 0..3u8 {
            m.handle_text(conn, &json!({"type":"audio_chunk","streamId":"s1","sequenceNumber":i}).to_string());
            m.handle_binary(conn, &frame::encode(FrameType::AudioData, &[i; 1024]));
        }
        assert_eq!(m.get_active_stream("esp-1").unwrap().byte_count, 3072);

        m.handle_text(
            conn,
            r#"{"type":"audio_end","streamId":"s1","totalChunks":3,"totalBytes":3072,"reason":"silence"}"#,
        );
        assert!(m.get_active_stream("esp-1").is_none());

        let events = drain(&mut rx);
        let complete = events
            .iter()
            .find_map(|e| match e {
                BridgeEvent::AudioComplete { audio, .. } => Some(audio.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(complete.len(), 3072);
        assert_eq!(&complete[..1024], &[0u8; 1024][..]);
        assert_eq!(&complete[2048..], &[2u8; 1024][..]);

        let end = events.iter().find(|e| e.name() == "audio:end").unwrap();
        match end {
            BridgeEvent::AudioEnd { chunk_count, byte_count, reason, .. } => {
                assert_eq!(*chunk_count, 3);
                assert_eq!(*byte_count, 3072);
                assert_eq!(reason.as_str(), "silence");
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_start_cancels_previous() {
        let (mut m, mut rx) = manager();
        let (conn, _t) = connect_online(&mut m, "esp-1");

        m.handle_text(conn, r#"{"type":"audio_start","streamId":"s1"}"#);
        m.handle_binary(conn, &frame::encode(FrameType::AudioData, &[1; 64]));
        m.handle_text(conn, r#"{"type":"audio_start","streamId":"s2"}"#);

        let last = m.session("esp-1").unwrap().capture.last_finished().unwrap().clone();
        assert_eq!(last.stream_id, "s1");
        assert_eq!(last.status, StreamStatus::Cancelled);

        m.handle_text(conn, r#"{"type":"audio_end","streamId":"s1"}"#);
        m.handle_text(conn, r#"{"type":"audio_end","streamId":"s2"}"#);

        let completes: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::AudioComplete { stream_id, .. } => Some(stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(completes, vec!["s2".to_string()]);
    }

    #[test]
    fn test_malformed_input_is_dropped() {
        let (mut m, mut rx) = manager();
        let (conn, transport) = connect_online(&mut m, "esp-1");
        drain(&mut rx);

        m.handle_binary(conn, &[0xE5, 0x32, 0x00]);
        m.handle_binary(conn, &[0xFF; 16]);
        m.handle_binary(conn, &frame::encode(FrameType::AudioData, &[1; 10]));
        m.handle_text(conn, r#"{"type":"firmware_update"}"#);
        m.handle_text(conn, "not json");

        assert!(drain(&mut rx).is_empty());
        assert!(m.is_connected("esp-1"));
        let errors = transport.texts_of("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["code"], "parse_error");
    }

    #[test]
    fn test_messages_before_handshake_are_rejected() {
        let (mut m, mut rx) = manager();
        let (conn, transport) = connect(&mut m, "esp-1");

        m.handle_text(conn, r#"{"type":"audio_start","streamId":"s1"}"#);
        m.handle_text(conn, r#"{"type":"status","status":"idle"}"#);

        assert!(m.get_active_stream("esp-1").is_none());
        assert!(drain(&mut rx).is_empty());
        let errors = transport.texts_of("error");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0]["code"], "handshake_required");
    }

    #[test]
    fn test_status_and_error_events() {
        let (mut m, mut rx) = manager();
        let (conn, _t) = connect_online(&mut m, "esp-1");
        drain(&mut rx);

        m.handle_text(conn, r#"{"type":"status","status":"listening","wifiStrength":-61,"freeMemory":120000}"#);
        m.handle_text(conn, r#"{"type":"error","code":"i2s_read","message":"mic timeout"}"#);

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["device:status", "device:error"]);
        let device = m.get_device("esp-1").unwrap();
        assert_eq!(device.last_status.unwrap().wifi_strength, Some(-61));
        assert!(m.is_connected("esp-1"));
    }

    #[test]
    fn test_device_error_naming_stream_fails_it() {
        let (mut m, mut rx) = manager();
        let (conn, _t) = connect_online(&mut m, "esp-1");

        m.handle_text(conn, r#"{"type":"audio_start","streamId":"s1"}"#);
        m.handle_binary(conn, &frame::encode(FrameType::AudioData, &[1; 64]));
        m.handle_text(
            conn,
            r#"{"type":"error","code":"audio","message":"dma overflow","details":{"streamId":"s1"}}"#,
        );

        assert!(m.get_active_stream("esp-1").is_none());
        let last = m.session("esp-1").unwrap().capture.last_finished().unwrap();
        assert_eq!(last.status, StreamStatus::Error);
        assert!(drain(&mut rx).iter().all(|e| e.name() != "audio:complete"));
    }

    #[test]
    fn test_liveness_timeout_disconnects_once() {
        let (mut m, mut rx) = manager();
        let (_conn, transport) = connect_online(&mut m, "esp-1");
        let (_conn2, transport2) = connect_online(&mut m, "esp-2");
        drain(&mut rx);

        let base = Instant::now();
        m.sessions.get_mut("esp-1").unwrap().last_ping_at = base;
        m.sessions.get_mut("esp-2").unwrap().last_ping_at = base;

        // Within the timeout both sessions get pinged.
        assert!(m.check_liveness(base + Duration::from_secs(30)).is_empty());
        assert_eq!(transport.texts_of("ping").len(), 1);
        assert_eq!(transport2.texts_of("ping").len(), 1);

        // esp-2 answered, esp-1 stayed silent.
        m.sessions.get_mut("esp-2").unwrap().last_ping_at = base + Duration::from_secs(30);
        let expired = m.check_liveness(base + Duration::from_secs(61));
        assert_eq!(expired, vec!["esp-1".to_string()]);
        assert_eq!(transport.close_reason().as_deref(), Some("timeout"));
        assert!(!m.is_connected("esp-1"));
        assert!(m.is_connected("esp-2"));
        assert_eq!(transport2.texts_of("ping").len(), 2);

        // A later sweep does not report it again.
        assert!(m.check_liveness(base + Duration::from_secs(62)).is_empty());

        let disconnects: Vec<BridgeEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.name() == "device:disconnected")
            .collect();
        assert_eq!(disconnects.len(), 1);
        match &disconnects[0] {
            BridgeEvent::DeviceDisconnected { device_id, reason, device } => {
                assert_eq!(device_id, "esp-1");
                assert_eq!(*reason, DisconnectReason::Timeout);
                assert_eq!(device.as_ref().unwrap().status, DeviceStatus::Offline);
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_pong_message_refreshes_liveness() {
        let (mut m, _rx) = manager();
        let (conn, _t) = connect_online(&mut m, "esp-1");
        let stale = m.session("esp-1").unwrap().last_ping_at;
        std::thread::sleep(Duration::from_millis(5));

        m.handle_text(conn, r#"{"type":"pong","timestamp":12}"#);

        assert!(m.session("esp-1").unwrap().last_ping_at > stale);
    }

    #[test]
    fn test_native_pong_refreshes_liveness() {
        let (mut m, _rx) = manager();
        let (conn, _t) = connect_online(&mut m, "esp-1");
        let before = m.session("esp-1").unwrap().last_ping_at;
        std::thread::sleep(Duration::from_millis(5));

        m.handle_native_pong(conn);

        assert!(m.session("esp-1").unwrap().last_ping_at > before);
    }

    #[test]
    fn test_handshake_timeout() {
        let (mut m, mut rx) = manager();
        let (conn, transport) = connect(&mut m, "esp-1");
        let (conn2, _t2) = connect_online(&mut m, "esp-2");

        assert!(m.expire_handshake(conn));
        assert!(!m.expire_handshake(conn));
        assert!(!m.expire_handshake(conn2));

        assert_eq!(transport.close_reason().as_deref(), Some("handshake_timeout"));
        assert!(m.get_device("esp-1").is_none());
        assert!(m.is_connected("esp-2"));
        let reasons: Vec<DisconnectReason> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                BridgeEvent::DeviceDisconnected { reason, .. } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![DisconnectReason::HandshakeTimeout]);
    }

    #[test]
    fn test_teardown_is_idempotent_and_cancels_stream() {
        let (mut m, mut rx) = manager();
        let (conn, transport) = connect_online(&mut m, "esp-1");
        m.handle_text(conn, r#"{"type":"audio_start","streamId":"s1"}"#);
        drain(&mut rx);

        transport.drop_connection();
        m.handle_transport_closed(conn, DisconnectReason::ClientClosed);
        m.handle_transport_closed(conn, DisconnectReason::ClientClosed);
        assert!(!m.close_connection("esp-1", DisconnectReason::ClientClosed));

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["device:disconnected"]);
        assert_eq!(m.session_count(), 0);
        assert!(m.get_device("esp-1").is_none());
        // The socket was already gone, so no close was attempted on it.
        assert_eq!(transport.close_reason(), None);

        // Frames from the dead connection go nowhere.
        m.handle_binary(conn, &frame::encode(FrameType::AudioData, &[1; 8]));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_stale_connection_cannot_close_new_session() {
        let (mut m, mut rx) = manager();
        let (old_conn, _old) = connect_online(&mut m, "esp-1");
        let (_new_conn, new_transport) = connect_online(&mut m, "esp-1");
        drain(&mut rx);

        m.handle_transport_closed(old_conn, DisconnectReason::ClientClosed);

        assert!(m.is_connected("esp-1"));
        assert!(new_transport.is_open());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_shutdown_closes_everything_and_stops_sending() {
        let (mut m, mut rx) = manager();
        let (_c1, t1) = connect_online(&mut m, "esp-1");
        let (_c2, t2) = connect(&mut m, "esp-2");
        drain(&mut rx);

        m.shutdown();

        assert_eq!(t1.close_reason().as_deref(), Some("server_shutdown"));
        assert_eq!(t2.close_reason().as_deref(), Some("server_shutdown"));
        assert_eq!(m.session_count(), 0);
        assert_eq!(names(&drain(&mut rx)), vec!["device:disconnected", "device:disconnected"]);

        let late = RecordingTransport::new();
        assert!(m.accept_connection(Some("esp-3".to_string()), None, late.clone()).is_none());
        assert_eq!(late.close_reason().as_deref(), Some("server_shutdown"));
        assert!(late.texts().is_empty());
    }

    #[test]
    fn test_send_message_and_config_push() {
        let (mut m, _rx) = manager();
        let (_c, transport) = connect_online(&mut m, "esp-1");
        let (_c2, pending) = connect(&mut m, "esp-2");

        assert!(m.send_message(
            "esp-1",
            &ServerMessage::TextResponse(crate::protocol::messages::TextResponse {
                text: "Hello".to_string(),
                is_partial: false,
            })
        ));
        assert!(!m.send_message("esp-2", &ServerMessage::Ping));
        assert!(!m.send_message("missing", &ServerMessage::Ping));
        assert!(pending.texts().is_empty());

        assert!(m.update_device_config(
            "esp-1",
            &ConfigMessage {
                volume: Some(150),
                ..Default::default()
            }
        ));
        let config = transport.texts_of("config");
        assert_eq!(config.len(), 1);
        assert_eq!(config[0]["volume"], 100);
        assert_eq!(m.get_device("esp-1").unwrap().config.volume, 100);
        assert_eq!(transport.texts_of("text_response")[0]["text"], "Hello");
    }

    #[test]
    fn test_handshake_with_unlisted_formats_comes_online() {
        let (mut m, mut rx) = manager();
        let (conn, transport) = connect(&mut m, "esp-1");

        m.handle_text(
            conn,
            &json!({
                "type": "handshake",
                "deviceId": "esp-1",
                "capabilities": {"hasSpeaker": true, "supportedFormats": ["pcm16", "wav"]}
            })
            .to_string(),
        );

        assert_eq!(transport.texts_of("handshake_ack").len(), 1);
        assert!(transport.texts_of("error").is_empty());
        assert!(m.is_connected("esp-1"));
        assert_eq!(m.get_capabilities("esp-1").unwrap().supported_formats, vec!["pcm16", "wav"]);
        assert_eq!(names(&drain(&mut rx)), vec!["device:connected"]);

        // A capabilities value of the wrong shape is dropped, not fatal.
        let (conn2, transport2) = connect(&mut m, "esp-2");
        m.handle_text(
            conn2,
            r#"{"type":"handshake","deviceId":"esp-2","capabilities":{"hasMicrophone":"yes"}}"#,
        );
        assert_eq!(transport2.texts_of("handshake_ack").len(), 1);
        assert!(m.is_connected("esp-2"));
        assert!(m.get_capabilities("esp-2").is_none());
    }

    #[test]
    fn test_handshake_claiming_live_id_replaces_it() {
        let (mut m, mut rx) = manager();
        let (_first_conn, first) = connect_online(&mut m, "esp-a");
        let transport = RecordingTransport::new();
        let info = m.accept_connection(None, None, transport.clone()).unwrap();
        drain(&mut rx);

        m.handle_text(info.connection_id, &handshake_json("esp-a"));

        assert_eq!(first.close_reason().as_deref(), Some("replaced"));
        assert!(!first.is_open());
        assert_eq!(m.session_count(), 1);
        assert_eq!(m.session("esp-a").unwrap().connection_id, info.connection_id);
        assert!(m.get_device(&info.device_id).is_none());
        assert_eq!(transport.texts_of("handshake_ack").len(), 1);

        let events = drain(&mut rx);
        let replaced: Vec<&BridgeEvent> = events
            .iter()
            .filter(|e| matches!(e, BridgeEvent::DeviceDisconnected { reason: DisconnectReason::Replaced, .. }))
            .collect();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].device_id(), "esp-a");
        assert_eq!(names(&events), vec!["device:disconnected", "device:connected"]);

        // The new connection now owns esp-a.
        m.handle_text(info.connection_id, r#"{"type":"audio_start","streamId":"r1"}"#);
        m.handle_binary(info.connection_id, &frame::encode(FrameType::AudioData, &[7; 32]));
        assert_eq!(m.get_active_stream("esp-a").unwrap().byte_count, 32);
        assert!(first.binaries().is_empty());
    }

    #[test]
    fn test_completion_survives_chunk_flood_from_other_device() {
        let (mut m, mut rx) = manager();
        let (conn_a, _ta) = connect_online(&mut m, "esp-a");
        let (conn_b, _tb) = connect_online(&mut m, "esp-b");
        drain(&mut rx);

        m.handle_text(conn_a, r#"{"type":"audio_start","streamId":"a1"}"#);
        m.handle_binary(conn_a, &frame::encode(FrameType::AudioData, &[1; 1024]));
        m.handle_text(conn_a, r#"{"type":"audio_end","streamId":"a1"}"#);

        // The subscriber is busy while esp-b streams far more frames than
        // the bus holds.
        m.handle_text(conn_b, r#"{"type":"audio_start","streamId":"b1"}"#);
        for _ in 0..300 {
            m.handle_binary(conn_b, &frame::encode(FrameType::AudioData, &[2; 1024]));
        }
        assert_eq!(m.get_active_stream("esp-b").unwrap().chunk_count, 300);

        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(e) => panic!("Event stream broke: {:?}", e),
            }
        }
        let completes: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::AudioComplete { stream_id, .. } => Some(stream_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completes, vec!["a1"]);
    }

    #[test]
    fn test_oversized_stream_fails_with_device_error() {
        let mut config = AppConfig::default();
        config.bridge.max_stream_bytes = 2048;
        let (mut m, mut rx) = manager_with(&config);
        let (conn, transport) = connect_online(&mut m, "esp-1");
        drain(&mut rx);

        m.handle_text(conn, r#"{"type":"audio_start","streamId":"s1"}"#);
        for i in 0..3u8 {
            m.handle_binary(conn, &frame::encode(FrameType::AudioData, &[i; 1024]));
        }
        m.handle_text(conn, r#"{"type":"audio_end","streamId":"s1"}"#);

        assert!(m.get_active_stream("esp-1").is_none());
        let last = m.session("esp-1").unwrap().capture.last_finished().unwrap();
        assert_eq!(last.status, StreamStatus::Error);
        assert_eq!(last.byte_count, 2048);

        let errors = transport.texts_of("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["code"], "stream_too_large");

        let events = drain(&mut rx);
        assert_eq!(names(&events), vec!["audio:start", "device:error"]);
        match &events[1] {
            BridgeEvent::DeviceError { error, .. } => {
                assert_eq!(error.code, "stream_too_large");
                assert_eq!(error.details.as_ref().unwrap()["streamId"], "s1");
            }
            other => panic!("Wrong event: {:?}", other),
        }
        assert!(m.is_connected("esp-1"));
    }

    #[test]
    fn test_playback_target_requires_online_session() {
        let (mut m, _rx) = manager();
        connect_online(&mut m, "esp-1");
        connect(&mut m, "esp-2");

        let target = m.playback_target("esp-1").unwrap();
        assert!(Arc::ptr_eq(&target.lock, &m.playback_target("esp-1").unwrap().lock));
        assert!(m.playback_target("esp-2").is_none());
        assert!(m.playback_target("esp-3").is_none());
    }
}
