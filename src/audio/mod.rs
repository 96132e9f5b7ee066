//! # Audio Streaming
//!
//! Both directions of device audio:
//! - **Capture**: inbound recordings rebuilt from AUDIO_DATA frames
//! - **Playback**: outbound speech split into AUDIO_PLAY_DATA frames
//!
//! Audio stays opaque bytes here (pcm16, opus, or mp3). Decoding and
//! speech recognition belong to the consumers of `audio:complete`.

pub mod buffer;     // Arrival-ordered chunk list
pub mod capture;    // Inbound stream state machine
pub mod playback;   // Outbound chunked sender
