//! # Capture Chunk Buffer
//!
//! Ordered list of payloads received for one inbound recording. Chunks are
//! kept exactly as they arrived and only joined once, when the recording ends.

use std::collections::VecDeque;

/// Arrival-ordered list of audio payloads.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one payload at the end of the list.
    pub fn push(&mut self, payload: &[u8]) {
        self.total_bytes += payload.len();
        self.chunks.push_back(payload.to_vec());
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total payload bytes held.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Join every chunk into one contiguous buffer in arrival order, leaving
    /// the list empty.
    pub fn concat(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        out
    }

    /// Drop every held chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}
