//! # Bridge Events
//!
//! Everything the bridge reports to the rest of the system (speech-to-text,
//! conversation layer, dashboards) goes through an [`EventBus`]. The bus is an
//! explicit value handed to the session manager, so several bridges (or tests)
//! can each have their own.
//!
//! ## Event Names:
//! - `device:connected`, `device:disconnected`, `device:error`, `device:status`
//! - `audio:start`, `audio:chunk`, `audio:end`, `audio:complete`
//!
//! ## Two Rings:
//! `audio:chunk` fires once per binary frame, so it travels on its own
//! broadcast ring ([`EventBus::subscribe_chunks`]). Everything else shares the
//! main ring ([`EventBus::subscribe`]), which only moves at the pace of
//! connections and recordings. A busy device can therefore lag the chunk
//! ring without pushing an `audio:complete` out of the main one.

use crate::audio::capture::AudioStreamState;
use crate::device::Device;
use crate::protocol::messages::{AudioFormat, DeviceErrorReport, EndReason, StatusReport};
use crate::session::DisconnectReason;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// An event published by the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    DeviceConnected {
        device: Device,
        session_id: String,
    },
    DeviceDisconnected {
        device_id: String,
        reason: DisconnectReason,
        /// Last registry entry, marked offline (None if it never had one)
        device: Option<Device>,
    },
    DeviceError {
        device_id: String,
        error: DeviceErrorReport,
    },
    DeviceStatus {
        device_id: String,
        report: StatusReport,
    },
    AudioStart {
        device_id: String,
        stream: AudioStreamState,
        reason: Option<String>,
    },
    AudioChunk {
        device_id: String,
        stream_id: String,
        chunk_index: u32,
        bytes: usize,
    },
    AudioEnd {
        device_id: String,
        stream_id: String,
        chunk_count: u32,
        byte_count: u64,
        reason: EndReason,
    },
    /// The full recording, ready for speech-to-text.
    AudioComplete {
        device_id: String,
        stream_id: String,
        format: AudioFormat,
        sample_rate: u32,
        channels: u8,
        audio: Arc<Vec<u8>>,
    },
}

impl BridgeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeEvent::DeviceConnected { .. } => "device:connected",
            BridgeEvent::DeviceDisconnected { .. } => "device:disconnected",
            BridgeEvent::DeviceError { .. } => "device:error",
            BridgeEvent::DeviceStatus { .. } => "device:status",
            BridgeEvent::AudioStart { .. } => "audio:start",
            BridgeEvent::AudioChunk { .. } => "audio:chunk",
            BridgeEvent::AudioEnd { .. } => "audio:end",
            BridgeEvent::AudioComplete { .. } => "audio:complete",
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            BridgeEvent::DeviceConnected { device, .. } => &device.id,
            BridgeEvent::DeviceDisconnected { device_id, .. }
            | BridgeEvent::DeviceError { device_id, .. }
            | BridgeEvent::DeviceStatus { device_id, .. }
            | BridgeEvent::AudioStart { device_id, .. }
            | BridgeEvent::AudioChunk { device_id, .. }
            | BridgeEvent::AudioEnd { device_id, .. }
            | BridgeEvent::AudioComplete { device_id, .. } => device_id,
        }
    }
}

/// Fan-out channel for [`BridgeEvent`]s.
///
/// Cloning the bus shares the same rings. Subscribers that fall more than
/// `capacity` events behind on a ring lose its oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
    chunks: broadcast::Sender<BridgeEvent>, // audio:chunk only
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (chunks, _) = broadcast::channel(capacity.max(1));
        Self { sender, chunks }
    }

    /// Publish an event on its ring. Having no subscribers is not an error.
    pub fn emit(&self, event: BridgeEvent) {
        let ring = match event {
            BridgeEvent::AudioChunk { .. } => &self.chunks,
            _ => &self.sender,
        };
        let _ = ring.send(event);
    }

    /// Every event except `audio:chunk`.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    /// Per-frame `audio:chunk` progress.
    pub fn subscribe_chunks(&self) -> broadcast::Receiver<BridgeEvent> {
        self.chunks.subscribe()
    }

    /// [`subscribe`](Self::subscribe) as a `Stream`; lagged notifications show
    /// up as `Err` items.
    pub fn stream(&self) -> BroadcastStream<BridgeEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn chunk_stream(&self) -> BroadcastStream<BridgeEvent> {
        BroadcastStream::new(self.chunks.subscribe())
    }

    /// Subscribers of the main ring.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
