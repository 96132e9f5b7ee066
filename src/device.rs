//! # Device Registry
//!
//! In-memory record of the devices that currently hold a connection: identity,
//! capabilities, last-known telemetry, and per-device settings.
//!
//! Only the session manager mutates the registry. Everyone else (HTTP query
//! routes, collaborators) gets cloned snapshots through read-only queries.
//! Nothing here survives a restart, and a device is dropped from the live set
//! as soon as its connection goes away.

use crate::protocol::messages::{ConfigMessage, StatusReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

/// Connection state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Connecting,
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// Per-device settings pushed to the firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub wake_word: String,
    pub language: String,
    /// 0-100
    pub volume: u8,
    /// 0-100
    pub sensitivity: u8,
    pub led_enabled: bool,
    pub auto_reconnect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wake_word: "hey bot".to_string(),
            language: "en".to_string(),
            volume: 70,
            sensitivity: 50,
            led_enabled: true,
            auto_reconnect: true,
        }
    }
}

impl DeviceConfig {
    /// Merge the fields present in a config message, clamping percentages.
    ///
    /// Returns true if anything changed.
    pub fn apply(&mut self, patch: &ConfigMessage) -> bool {
        let before = self.clone();

        if let Some(wake_word) = &patch.wake_word {
            self.wake_word = wake_word.clone();
        }
        if let Some(language) = &patch.language {
            self.language = language.clone();
        }
        if let Some(volume) = patch.volume {
            self.volume = volume.min(100);
        }
        if let Some(sensitivity) = patch.sensitivity {
            self.sensitivity = sensitivity.min(100);
        }
        if let Some(led_enabled) = patch.led_enabled {
            self.led_enabled = led_enabled;
        }

        *self != before
    }
}

/// Hardware features announced in the handshake.
///
/// The object is open-ended: unknown keys land in `extra`, and format names
/// are kept as plain strings (firmware may list codecs the bridge never
/// negotiates, such as `wav`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub has_microphone: bool,
    pub has_speaker: bool,
    pub has_display: bool,
    pub has_led: bool,
    pub supported_formats: Vec<String>,
    pub max_sample_rate: Option<u32>,
    pub buffer_size: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Capabilities {
    /// Deserialize an optional capabilities object without failing the
    /// enclosing message. A value that does not fit the schema becomes None.
    pub(crate) fn deserialize_lenient<'de, D>(deserializer: D) -> Result<Option<Capabilities>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.and_then(|value| match serde_json::from_value::<Capabilities>(value) {
            Ok(caps) => Some(caps),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed device capabilities");
                None
            }
        }))
    }
}

/// Identity and last-known state of one physical unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub display_name: String,
    pub mac_address: Option<String>,
    pub ip_address: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub firmware_version: Option<String>,
    pub config: DeviceConfig,
    pub capabilities: Option<Capabilities>,
    pub last_status: Option<StatusReport>,
}

impl Device {
    /// A freshly connected, not yet identified device.
    pub fn new(id: impl Into<String>, ip_address: Option<String>, config: DeviceConfig) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            mac_address: None,
            ip_address,
            status: DeviceStatus::Connecting,
            last_seen: Utc::now(),
            firmware_version: None,
            config,
            capabilities: None,
            last_status: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Live set of connected devices keyed by device id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device entry.
    pub fn insert(&mut self, device: Device) {
        self.devices.insert(device.id.clone(), device);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<Device> {
        self.devices.remove(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut Device> {
        self.devices.get_mut(device_id)
    }

    /// Devices that completed a handshake, ordered by id.
    pub fn list_connected(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Online)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.devices
            .get(device_id)
            .map(|d| d.status == DeviceStatus::Online)
            .unwrap_or(false)
    }

    pub fn get_capabilities(&self, device_id: &str) -> Option<Capabilities> {
        self.devices.get(device_id).and_then(|d| d.capabilities.clone())
    }

}
