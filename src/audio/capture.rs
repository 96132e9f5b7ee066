//! # Audio Capture Stream Machine
//!
//! Rebuilds one recording from the binary AUDIO_DATA frames a device sends
//! between an `audio_start` and an `audio_end` control message.
//!
//! ## Stream Lifecycle:
//! 1. **Active**: created by `audio_start`, frames are appended in arrival order
//! 2. **Completed**: `audio_end` joined the chunks and published the recording
//! 3. **Cancelled**: replaced by a newer `audio_start`, or the session closed
//! 4. **Error**: the device reported an error mid-recording
//!
//! Each session has one [`CaptureSlot`] holding at most one active stream,
//! capped at a configured byte size (a stream that outgrows it fails).
//! Starting a new stream cancels the previous one; frames that arrive while no
//! stream is active are dropped rather than held for a stream that may start
//! later (the control message always precedes its data).

use crate::audio::buffer::ChunkBuffer;
use crate::events::{BridgeEvent, EventBus};
use crate::protocol::messages::{AudioChunkMeta, AudioEnd, AudioFormat, AudioStart};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Status of an inbound recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Completed,
    Cancelled,
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamStatus::Active => "active",
            StreamStatus::Completed => "completed",
            StreamStatus::Cancelled => "cancelled",
            StreamStatus::Error => "error",
        }
    }
}

/// Bookkeeping for one inbound recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStreamState {
    pub stream_id: String,
    pub device_id: String,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Binary frames received
    pub chunk_count: u32,
    pub byte_count: u64,
    /// Highest sequence number announced by `audio_chunk`
    pub last_sequence: Option<u32>,
    pub status: StreamStatus,
}

/// Capture messages that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("no active audio stream")]
    NoActiveStream,

    #[error("stream {got} is not the active stream {active}")]
    StreamMismatch { active: String, got: String },

    #[error("stream {stream_id} exceeded {limit} bytes")]
    TooLarge { stream_id: String, limit: u64 },
}

#[derive(Debug)]
struct ActiveCapture {
    state: AudioStreamState,
    chunks: ChunkBuffer,
}

/// The single capture stream slot of a session.
#[derive(Debug)]
pub struct CaptureSlot {
    active: Option<ActiveCapture>,
    last_finished: Option<AudioStreamState>,
    max_stream_bytes: u64,
}

impl CaptureSlot {
    pub fn new(max_stream_bytes: u64) -> Self {
        Self {
            active: None,
            last_finished: None,
            max_stream_bytes,
        }
    }

    /// Begin a new recording, cancelling any recording still active.
    pub fn start(&mut self, device_id: &str, start: &AudioStart, bus: &EventBus) -> &AudioStreamState {
        if let Some(previous) = self.cancel() {
            info!(
                device_id = %device_id,
                stream_id = %previous.stream_id,
                replaced_by = %start.stream_id,
                "Cancelled active audio stream for new audio_start"
            );
        }

        let state = AudioStreamState {
            stream_id: start.stream_id.clone(),
            device_id: device_id.to_string(),
            format: start.format,
            sample_rate: start.sample_rate,
            channels: start.channels,
            start_time: Utc::now(),
            end_time: None,
            chunk_count: 0,
            byte_count: 0,
            last_sequence: None,
            status: StreamStatus::Active,
        };

        info!(
            device_id = %device_id,
            stream_id = %state.stream_id,
            format = state.format.as_str(),
            sample_rate = state.sample_rate,
            channels = state.channels,
            "Audio stream started"
        );

        bus.emit(BridgeEvent::AudioStart {
            device_id: device_id.to_string(),
            stream: state.clone(),
            reason: start.reason.clone(),
        });

        &self
            .active
            .insert(ActiveCapture {
                state,
                chunks: ChunkBuffer::new(),
            })
            .state
    }

    /// Record an `audio_chunk` announcement. Carries no audio.
    pub fn chunk_meta(&mut self, meta: &AudioChunkMeta) -> Result<(), CaptureError> {
        let active = self.active_for(&meta.stream_id)?;
        let state = &mut active.state;
        state.last_sequence = Some(state.last_sequence.map_or(meta.sequence_number, |s| s.max(meta.sequence_number)));
        Ok(())
    }

    /// Append an AUDIO_DATA payload to the active recording.
    ///
    /// Returns the zero-based index of the appended chunk. A payload that
    /// would take the recording past the size cap fails the stream instead.
    pub fn ingest(&mut self, payload: &[u8], bus: &EventBus) -> Result<u32, CaptureError> {
        let limit = self.max_stream_bytes;
        let active = self.active.as_mut().ok_or(CaptureError::NoActiveStream)?;

        if active.chunks.total_bytes() as u64 + payload.len() as u64 > limit {
            let stream_id = active.state.stream_id.clone();
            self.fail();
            return Err(CaptureError::TooLarge { stream_id, limit });
        }

        active.chunks.push(payload);
        let chunk_index = active.state.chunk_count;
        active.state.chunk_count += 1;
        active.state.byte_count += payload.len() as u64;

        bus.emit(BridgeEvent::AudioChunk {
            device_id: active.state.device_id.clone(),
            stream_id: active.state.stream_id.clone(),
            chunk_index,
            bytes: payload.len(),
        });

        Ok(chunk_index)
    }

    /// Finish the active recording and publish the joined audio.
    pub fn end(&mut self, end: &AudioEnd, bus: &EventBus) -> Result<AudioStreamState, CaptureError> {
        self.active_for(&end.stream_id)?;
        let Some(ActiveCapture { mut state, mut chunks }) = self.active.take() else {
            return Err(CaptureError::NoActiveStream);
        };

        if let Some(expected) = end.total_chunks {
            if expected != state.chunk_count {
                warn!(
                    device_id = %state.device_id,
                    stream_id = %state.stream_id,
                    expected,
                    received = state.chunk_count,
                    "Audio chunk count mismatch"
                );
            }
        }
        if let Some(expected) = end.total_bytes {
            if expected != state.byte_count {
                warn!(
                    device_id = %state.device_id,
                    stream_id = %state.stream_id,
                    expected,
                    received = state.byte_count,
                    "Audio byte count mismatch"
                );
            }
        }

        if chunks.is_empty() {
            debug!(device_id = %state.device_id, stream_id = %state.stream_id, "Audio stream ended without data");
        }
        let audio = chunks.concat();
        state.status = StreamStatus::Completed;
        state.end_time = Some(Utc::now());

        info!(
            device_id = %state.device_id,
            stream_id = %state.stream_id,
            chunks = state.chunk_count,
            bytes = state.byte_count,
            reason = end.reason.as_str(),
            "Audio stream completed"
        );

        bus.emit(BridgeEvent::AudioEnd {
            device_id: state.device_id.clone(),
            stream_id: state.stream_id.clone(),
            chunk_count: state.chunk_count,
            byte_count: state.byte_count,
            reason: end.reason,
        });
        bus.emit(BridgeEvent::AudioComplete {
            device_id: state.device_id.clone(),
            stream_id: state.stream_id.clone(),
            format: state.format,
            sample_rate: state.sample_rate,
            channels: state.channels,
            audio: Arc::new(audio),
        });

        self.last_finished = Some(state.clone());
        Ok(state)
    }

    /// Drop the active recording without publishing it.
    pub fn cancel(&mut self) -> Option<AudioStreamState> {
        self.finish_without_audio(StreamStatus::Cancelled)
    }

    /// Mark the active recording as failed and drop its audio.
    pub fn fail(&mut self) -> Option<AudioStreamState> {
        self.finish_without_audio(StreamStatus::Error)
    }

    pub fn active(&self) -> Option<&AudioStreamState> {
        self.active.as_ref().map(|a| &a.state)
    }

    /// The most recent recording that left the active state.
    pub fn last_finished(&self) -> Option<&AudioStreamState> {
        self.last_finished.as_ref()
    }

    fn finish_without_audio(&mut self, status: StreamStatus) -> Option<AudioStreamState> {
        let ActiveCapture { mut state, mut chunks } = self.active.take()?;
        let dropped_chunks = chunks.len();
        chunks.clear();
        state.status = status;
        state.end_time = Some(Utc::now());
        debug!(
            device_id = %state.device_id,
            stream_id = %state.stream_id,
            status = status.as_str(),
            dropped_chunks,
            "Audio stream released"
        );
        self.last_finished = Some(state.clone());
        Some(state)
    }

    fn active_for(&mut self, stream_id: &str) -> Result<&mut ActiveCapture, CaptureError> {
        let active = self.active.as_mut().ok_or(CaptureError::NoActiveStream)?;
        if active.state.stream_id != stream_id {
            return Err(CaptureError::StreamMismatch {
                active: active.state.stream_id.clone(),
                got: stream_id.to_string(),
            });
        }
        Ok(active)
    }
}
