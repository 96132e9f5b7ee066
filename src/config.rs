//! # Configuration Management
//!
//! Loads the bridge configuration from several sources, highest priority first:
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables with the `APP_` prefix, `__` between levels
//!    (`APP_BRIDGE__PING_TIMEOUT_MS=90000` sets `bridge.ping_timeout_ms`)
//! 3. `config.toml` in the working directory, if present
//! 4. Built-in defaults
//!
//! All timeouts are in milliseconds.
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs are serialized (as the default layer) and
//!   deserialized (from the merged layers)
//! - **`config` crate**: builder that merges sources, later sources winning
//! - **`anyhow::Context`**: attaches a readable message to a lower-level error

use crate::device::DeviceConfig;
use anyhow::{Context, Result};       // Error handling with context
use serde::{Deserialize, Serialize}; // For converting to/from TOML and env values
use std::env;                        // For the HOST / PORT overrides
use std::time::Duration;

/// Main application configuration.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Serialize` lets [`AppConfig::default`] seed the
///   `config` builder; `Deserialize` reads the merged result back
/// - **Nested structs**: each section maps to a TOML table (`[bridge]`,
///   `[playback]`, ...) and to an `APP_<SECTION>__<FIELD>` variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bridge: BridgeConfig,
    pub playback: PlaybackConfig,
    pub device_defaults: DeviceDefaults,
    pub vad: VadConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16, // u16 covers the whole TCP port range
    /// Path devices connect to, with `?id=<deviceId>`
    pub ws_path: String,
}

/// Session lifecycle timing.
///
/// ## Fields:
/// - `handshake_timeout_ms`: how long a new connection may stay silent before
///   it is closed with `handshake_timeout`
/// - `ping_interval_ms`: period of the liveness sweep over all sessions
/// - `ping_timeout_ms`: silence after which a session is closed with `timeout`
/// - `event_capacity`: events buffered per subscriber before the oldest are lost
/// - `max_stream_bytes`: largest recording one capture stream may hold; a
///   stream that grows past it fails with a `stream_too_large` device error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub handshake_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub event_capacity: usize,
    pub max_stream_bytes: u64, // 10 MiB is about 5 minutes of 16 kHz mono pcm16
}

impl BridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            ping_interval_ms: 30_000,
            ping_timeout_ms: 60_000,
            event_capacity: 256,
            max_stream_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Outbound audio chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Bytes per AUDIO_PLAY_DATA frame (device receive buffer size)
    pub chunk_size: usize,
    pub chunk_delay_ms: u64,
    pub channels: u8,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            chunk_delay_ms: 10,
            channels: 1,
        }
    }
}

/// Settings given to devices that connect for the first time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefaults {
    pub wake_word: String,
    pub language: String,
    pub volume: u8,
    pub sensitivity: u8,
    pub led_enabled: bool,
    pub auto_reconnect: bool,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        let config = DeviceConfig::default();
        Self {
            wake_word: config.wake_word,
            language: config.language,
            volume: config.volume,
            sensitivity: config.sensitivity,
            led_enabled: config.led_enabled,
            auto_reconnect: config.auto_reconnect,
        }
    }
}

impl DeviceDefaults {
    pub fn to_device_config(&self) -> DeviceConfig {
        DeviceConfig {
            wake_word: self.wake_word.clone(),
            language: self.language.clone(),
            volume: self.volume,
            sensitivity: self.sensitivity,
            led_enabled: self.led_enabled,
            auto_reconnect: self.auto_reconnect,
        }
    }
}

/// Voice-activity detection defaults sent in the handshake ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    /// Energy threshold, 0.0-1.0
    pub threshold: f32,
    pub silence_timeout_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            silence_timeout_ms: 1500,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(), // devices connect over the LAN
                port: 8080,
                ws_path: "/ws/esp32".to_string(),
            },
            bridge: BridgeConfig::default(),
            playback: PlaybackConfig::default(),
            device_defaults: DeviceDefaults::default(),
            vad: VadConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml`, and the environment.
    ///
    /// ## Rust Concepts:
    /// - **Builder pattern**: chained `add_source` calls, later sources override earlier ones
    /// - **?**: early return on error (a bad TOML file or an unparsable env value)
    /// - **if let Ok(...)**: only override when the variable is set
    ///
    /// ## Environment Variable Examples:
    /// - `APP_BRIDGE__MAX_STREAM_BYTES=20971520`: allow 20 MiB recordings
    /// - `APP_PLAYBACK__CHUNK_SIZE=2048`: smaller device receive buffer
    /// - `PORT=3000`: special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Invalid configuration")?;
        Ok(config)
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow::anyhow!("WebSocket path must start with '/'"));
        }

        let bridge = &self.bridge;
        if bridge.handshake_timeout_ms == 0 || bridge.ping_interval_ms == 0 || bridge.ping_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Bridge timeouts must be greater than 0"));
        }

        if bridge.ping_timeout_ms <= bridge.ping_interval_ms {
            return Err(anyhow::anyhow!(
                "Ping timeout ({}ms) must be longer than the ping interval ({}ms)",
                bridge.ping_timeout_ms,
                bridge.ping_interval_ms
            ));
        }

        if bridge.max_stream_bytes == 0 {
            return Err(anyhow::anyhow!("Maximum audio stream size must be greater than 0"));
        }

        if self.playback.chunk_size == 0 {
            return Err(anyhow::anyhow!("Playback chunk size must be greater than 0"));
        }

        if self.playback.channels == 0 {
            return Err(anyhow::anyhow!("Playback channels must be greater than 0"));
        }

        if self.device_defaults.volume > 100 || self.device_defaults.sensitivity > 100 {
            return Err(anyhow::anyhow!("Device volume and sensitivity must be within 0-100"));
        }

        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(anyhow::anyhow!("VAD threshold must be within 0.0-1.0"));
        }

        Ok(())
    }
}
