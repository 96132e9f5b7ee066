//! # Audio Playback Pipeline
//!
//! Delivers a synthesized-speech buffer to a device in small pieces so it fits
//! the firmware's receive buffer.
//!
//! ## Send Sequence:
//! 1. `audio_play` announcing the stream (`totalChunks`, `totalBytes`)
//! 2. For every chunk: `audio_play_chunk` metadata, then one AUDIO_PLAY_DATA frame
//! 3. A short pacing delay between chunks
//!
//! The pipeline does not wait for any playback acknowledgement. If the
//! connection closes mid-send the remaining chunks are abandoned and the caller
//! sees `false`.

use crate::config::PlaybackConfig;
use crate::protocol::frame::{self, FrameType};
use crate::protocol::messages::{AudioFormat, AudioPlay, AudioPlayChunk, ServerMessage};
use crate::transport::Transport;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Parameters of one playback send.
#[derive(Debug, Clone)]
pub struct PlaybackOptions {
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub channels: u8,
    /// Bytes per AUDIO_PLAY_DATA frame
    pub chunk_size: usize,
    /// Pause between consecutive chunks
    pub chunk_delay: Duration,
}

impl PlaybackOptions {
    pub fn new(config: &PlaybackConfig, format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            format,
            sample_rate,
            channels: config.channels,
            chunk_size: config.chunk_size,
            chunk_delay: Duration::from_millis(config.chunk_delay_ms),
        }
    }
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self::new(&PlaybackConfig::default(), AudioFormat::Pcm16, 16000)
    }
}

/// Number of frames needed for `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Stream `audio` to a device.
///
/// Returns false without sending anything when the transport is already
/// closed or the buffer is empty, and false if the transport closes before
/// the last chunk went out.
pub async fn send(transport: &dyn Transport, device_id: &str, audio: &[u8], options: &PlaybackOptions) -> bool {
    if !transport.is_open() {
        warn!(device_id = %device_id, "Playback skipped, connection is not open");
        return false;
    }
    if audio.is_empty() {
        warn!(device_id = %device_id, "Playback skipped, empty audio buffer");
        return false;
    }

    let stream_id = Uuid::new_v4().to_string();
    let chunk_size = options.chunk_size.max(1);
    let total_chunks = chunk_count(audio.len(), chunk_size);

    let announce = ServerMessage::AudioPlay(AudioPlay {
        stream_id: stream_id.clone(),
        format: options.format,
        sample_rate: options.sample_rate,
        channels: options.channels,
        total_chunks: total_chunks as u32,
        total_bytes: audio.len() as u64,
    });
    if !send_json(transport, &announce) {
        return false;
    }

    info!(
        device_id = %device_id,
        stream_id = %stream_id,
        bytes = audio.len(),
        chunks = total_chunks,
        "Playback started"
    );

    for (sequence, chunk) in audio.chunks(chunk_size).enumerate() {
        let is_final = sequence + 1 == total_chunks;
        let meta = ServerMessage::AudioPlayChunk(AudioPlayChunk {
            stream_id: stream_id.clone(),
            sequence_number: sequence as u32,
            is_final,
        });

        if !send_json(transport, &meta) || !transport.send_binary(frame::encode(FrameType::AudioPlayData, chunk)) {
            warn!(
                device_id = %device_id,
                stream_id = %stream_id,
                sent = sequence,
                total = total_chunks,
                "Playback aborted, connection closed"
            );
            return false;
        }

        if !is_final && !options.chunk_delay.is_zero() {
            tokio::time::sleep(options.chunk_delay).await;
        }
    }

    debug!(device_id = %device_id, stream_id = %stream_id, "Playback sent");
    true
}

fn send_json(transport: &dyn Transport, message: &ServerMessage) -> bool {
    match message.to_json() {
        Ok(json) => transport.send_text(json),
        Err(e) => {
            warn!("Failed to serialize outbound message: {}", e);
            false
        }
    }
}
