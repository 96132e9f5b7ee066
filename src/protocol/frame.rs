//! # Binary Frame Codec
//!
//! Encodes and decodes the fixed 8-byte header that wraps raw audio payloads
//! on the device WebSocket.
//!
//! ## Frame Layout (all integers big-endian):
//! ```text
//! ┌──────────┬──────────┬──────────────┬─────────────────────┐
//! │ 0..2     │ 2..4     │ 4..8         │ 8..8+length         │
//! │ magic    │ type     │ length (u32) │ payload             │
//! └──────────┴──────────┴──────────────┴─────────────────────┘
//! ```
//!
//! Each WebSocket binary message carries exactly one frame. There is no
//! reassembly across messages: anything that does not decode is dropped by
//! the caller.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use thiserror::Error;

/// Protocol identifier in the first two bytes of every frame.
pub const FRAME_MAGIC: u16 = 0xE532;

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 8;

/// Kind of payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Microphone audio, device to server
    AudioData,
    /// Synthesized speech, server to device
    AudioPlayData,
}

impl FrameType {
    /// Wire code of this frame type.
    pub fn code(self) -> u16 {
        match self {
            FrameType::AudioData => 0x0001,
            FrameType::AudioPlayData => 0x0002,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x0001 => Some(FrameType::AudioData),
            0x0002 => Some(FrameType::AudioPlayData),
            _ => None,
        }
    }
}

/// Reasons a binary message could not be decoded into a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, header needs 8")]
    TooShort(usize),

    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),

    #[error("unknown frame type 0x{0:04x}")]
    UnknownType(u16),

    #[error("incomplete frame: header declares {declared} bytes, {available} available")]
    Incomplete { declared: usize, available: usize },
}

/// A decoded frame borrowing its payload from the transport buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_type: FrameType,
    pub payload: &'a [u8],
}

/// Decode one frame from a complete binary message.
///
/// Trailing bytes beyond the declared length are ignored.
pub fn decode(bytes: &[u8]) -> Result<Frame<'_>, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }

    let magic = BigEndian::read_u16(&bytes[0..2]);
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }

    let code = BigEndian::read_u16(&bytes[2..4]);
    let declared = BigEndian::read_u32(&bytes[4..8]) as usize;
    let available = bytes.len() - HEADER_LEN;
    if declared > available {
        return Err(FrameError::Incomplete { declared, available });
    }

    let frame_type = FrameType::from_code(code).ok_or(FrameError::UnknownType(code))?;

    Ok(Frame {
        frame_type,
        payload: &bytes[HEADER_LEN..HEADER_LEN + declared],
    })
}

/// Build a frame: header followed by the payload.
///
/// The length field is the payload length truncated to 32 bits; device
/// frames stay far below that in practice.
pub fn encode(frame_type: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    // Writes into a Vec cannot fail.
    let _ = out.write_u16::<BigEndian>(FRAME_MAGIC);
    let _ = out.write_u16::<BigEndian>(frame_type.code());
    let _ = out.write_u32::<BigEndian>(payload.len() as u32);
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_input_is_rejected() {
        for len in 0..HEADER_LEN {
            let bytes = vec![0xE5; len];
            assert_eq!(decode(&bytes), Err(FrameError::TooShort(len)));
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode(FrameType::AudioData, &[1, 2, 3]);
        bytes[0] = 0x00;
        bytes[1] = 0x01;
        assert_eq!(decode(&bytes), Err(FrameError::BadMagic(0x0001)));
    }

    #[test]
    fn test_declared_length_exceeds_available() {
        let mut bytes = encode(FrameType::AudioData, &[0u8; 16]);
        bytes.truncate(HEADER_LEN + 10);
        assert_eq!(
            decode(&bytes),
            Err(FrameError::Incomplete { declared: 16, available: 10 })
        );
    }

    #[test]
    fn test_unknown_type() {
        let mut bytes = encode(FrameType::AudioData, &[9]);
        bytes[3] = 0x7F;
        assert_eq!(decode(&bytes), Err(FrameError::UnknownType(0x007F)));
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(FrameType::AudioPlayData, &[0xAA; 300]);
        assert_eq!(bytes.len(), HEADER_LEN + 300);
        assert_eq!(&bytes[..8], &[0xE5, 0x32, 0x00, 0x02, 0x00, 0x00, 0x01, 0x2C]);
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut bytes = encode(FrameType::AudioData, &[1, 2, 3, 4]);
        bytes.extend_from_slice(&[0xFF, 0xFF]);
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame.payload, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_decode_preserves_type_and_payload() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        for frame_type in [FrameType::AudioData, FrameType::AudioPlayData] {
            let bytes = encode(frame_type, &payload);
            let frame = decode(&bytes).unwrap();
            assert_eq!(frame.frame_type, frame_type);
            assert_eq!(frame.payload, payload.as_slice());
        }

        let empty = encode(FrameType::AudioData, &[]);
        assert_eq!(decode(&empty).unwrap().payload, &[] as &[u8]);
    }
}
