//! # Device Wire Protocol
//!
//! The device protocol mixes two kinds of WebSocket messages:
//! - **Text**: JSON control messages ([`messages`])
//! - **Binary**: raw audio wrapped in a fixed 8-byte header ([`frame`])
//!
//! Stream correlation is done entirely by the JSON messages that bracket the
//! binary frames; a frame only knows its type and its bytes.

pub mod frame;
pub mod messages;

pub use frame::{FrameError, FrameType};
pub use messages::{AudioFormat, DeviceMessage, EndReason, MessageError, ServerMessage};
