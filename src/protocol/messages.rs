//! # Device JSON Messages
//!
//! Text frames on the device WebSocket are JSON objects of the form
//! `{"type": "...", "timestamp": <ms>, ...fields}` with camelCase field names.
//!
//! - [`DeviceMessage`]: everything a device may send (handshake, audio control,
//!   status, pong, error).
//! - [`ServerMessage`]: everything the bridge sends back (acks, pings, config,
//!   commands, playback control, text responses, errors).
//!
//! The raw audio bytes never travel inside JSON; they follow as binary frames
//! (see [`crate::protocol::frame`]).

use crate::device::{Capabilities, DeviceConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Message types a device is allowed to send.
pub const INBOUND_TYPES: &[&str] = &[
    "handshake",
    "audio_start",
    "audio_chunk",
    "audio_end",
    "status",
    "pong",
    "error",
];

/// Encoding of an audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Pcm16,
    Opus,
    Mp3,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "pcm16",
            AudioFormat::Opus => "opus",
            AudioFormat::Mp3 => "mp3",
        }
    }
}

/// Why a device ended a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Silence,
    Timeout,
    #[default]
    User,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Silence => "silence",
            EndReason::Timeout => "timeout",
            EndReason::User => "user",
            EndReason::Error => "error",
        }
    }
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u8 {
    1
}

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub device_id: String,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, deserialize_with = "Capabilities::deserialize_lenient")]
    pub capabilities: Option<Capabilities>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStart {
    pub stream_id: String,
    #[serde(default)]
    pub format: AudioFormat,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Metadata announcing the next AUDIO_DATA frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunkMeta {
    pub stream_id: String,
    pub sequence_number: u32,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEnd {
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default)]
    pub reason: EndReason,
}

/// Periodic telemetry pushed by the device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi_strength: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_memory: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pong {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// An error reported by the device itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceErrorReport {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Messages sent by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    Handshake(Handshake),
    AudioStart(AudioStart),
    AudioChunk(AudioChunkMeta),
    AudioEnd(AudioEnd),
    Status(StatusReport),
    Pong(Pong),
    Error(DeviceErrorReport),
}

/// Why a text frame could not be turned into a [`DeviceMessage`].
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("message has no \"type\" field")]
    MissingType,

    #[error("unknown message type \"{0}\"")]
    UnknownType(String),

    #[error("invalid \"{kind}\" message: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MessageError {
    /// Code sent back to the device in an `error` message.
    pub fn code(&self) -> &'static str {
        match self {
            MessageError::InvalidJson(_) => "parse_error",
            MessageError::MissingType => "missing_type",
            MessageError::UnknownType(_) => "unknown_type",
            MessageError::InvalidPayload { .. } => "invalid_message",
        }
    }
}

impl DeviceMessage {
    /// Parse a text frame, separating bad JSON from unknown or malformed types.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text).map_err(MessageError::InvalidJson)?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?
            .to_string();

        if !INBOUND_TYPES.contains(&kind.as_str()) {
            return Err(MessageError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|source| MessageError::InvalidPayload { kind, source })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceMessage::Handshake(_) => "handshake",
            DeviceMessage::AudioStart(_) => "audio_start",
            DeviceMessage::AudioChunk(_) => "audio_chunk",
            DeviceMessage::AudioEnd(_) => "audio_end",
            DeviceMessage::Status(_) => "status",
            DeviceMessage::Pong(_) => "pong",
            DeviceMessage::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAck {
    pub success: bool,
    pub session_id: String,
    /// Milliseconds since the Unix epoch.
    pub server_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigMessage>,
}

/// Device settings pushed by the server. Absent fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_word: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub led_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad_threshold: Option<f32>,
    /// Milliseconds of silence that end a recording.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub silence_timeout: Option<u64>,
}

impl ConfigMessage {
    /// Full config message for a device, as sent in the handshake ack.
    pub fn from_device_config(config: &DeviceConfig, vad_threshold: f32, silence_timeout_ms: u64) -> Self {
        Self {
            wake_word: Some(config.wake_word.clone()),
            language: Some(config.language.clone()),
            volume: Some(config.volume),
            sensitivity: Some(config.sensitivity),
            led_enabled: Some(config.led_enabled),
            vad_threshold: Some(vad_threshold),
            silence_timeout: Some(silence_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Announces an outbound playback stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPlay {
    pub stream_id: String,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u8,
    pub total_chunks: u32,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPlayChunk {
    pub stream_id: String,
    pub sequence_number: u32,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextResponse {
    pub text: String,
    #[serde(default)]
    pub is_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

/// Messages sent by the bridge to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    HandshakeAck(HandshakeAck),
    Ping,
    Config(ConfigMessage),
    Command(CommandMessage),
    AudioPlay(AudioPlay),
    AudioPlayChunk(AudioPlayChunk),
    TextResponse(TextResponse),
    Error(ErrorMessage),
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            code: code.into(),
            message: message.into(),
        })
    }

    /// Serialize with the envelope `timestamp` (ms since epoch) added.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.insert(
                "timestamp".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }
        serde_json::to_string(&value)
    }
}
