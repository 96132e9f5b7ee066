//! # Device Transport
//!
//! The session manager never touches sockets directly. Each connection is seen
//! through the [`Transport`] trait, which the WebSocket actor implements and
//! tests replace with an in-memory recorder.

use std::fmt;

/// Outbound half of one device connection.
///
/// Sends are non-blocking hand-offs; they return false once the connection is
/// closed.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Queue a JSON text message.
    fn send_text(&self, text: String) -> bool;

    /// Queue a binary frame.
    fn send_binary(&self, data: Vec<u8>) -> bool;

    /// Close the connection with a reason string. Closing twice is harmless.
    fn close(&self, reason: &str);

    /// Whether the connection can still accept messages.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Transport;
    use crate::protocol::frame;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    /// One recorded outbound message.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Sent {
        Text(Value),
        Binary(Vec<u8>),
        Close(String),
    }

    /// In-memory transport that records everything sent through it.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        sent: Mutex<Vec<Sent>>,
        closed: AtomicBool,
        /// Close automatically after this many successful sends.
        close_after: Mutex<Option<usize>>,
    }

    impl RecordingTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn closing_after(sends: usize) -> Arc<Self> {
            let transport = Self::default();
            *transport.close_after.lock().unwrap() = Some(sends);
            Arc::new(transport)
        }

        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }

        /// JSON messages sent, in order.
        pub fn texts(&self) -> Vec<Value> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Text(v) => Some(v),
                    _ => None,
                })
                .collect()
        }

        /// JSON messages of one `type`.
        pub fn texts_of(&self, kind: &str) -> Vec<Value> {
            self.texts().into_iter().filter(|v| v["type"] == kind).collect()
        }

        pub fn binaries(&self) -> Vec<Vec<u8>> {
            self.sent()
                .into_iter()
                .filter_map(|s| match s {
                    Sent::Binary(b) => Some(b),
                    _ => None,
                })
                .collect()
        }

        pub fn close_reason(&self) -> Option<String> {
            self.sent().into_iter().find_map(|s| match s {
                Sent::Close(r) => Some(r),
                _ => None,
            })
        }

        /// Simulate the peer going away.
        pub fn drop_connection(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn record(&self, item: Sent) -> bool {
            if self.closed.load(Ordering::SeqCst) {
                return false;
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(item);
            if let Some(limit) = *self.close_after.lock().unwrap() {
                if sent.len() >= limit {
                    self.closed.store(true, Ordering::SeqCst);
                }
            }
            true
        }
    }

    impl Transport for RecordingTransport {
        fn send_text(&self, text: String) -> bool {
            let value = serde_json::from_str(&text).unwrap();
            self.record(Sent::Text(value))
        }

        fn send_binary(&self, data: Vec<u8>) -> bool {
            // Everything the bridge sends must be a valid frame.
            assert!(frame::decode(&data).is_ok());
            self.record(Sent::Binary(data))
        }

        fn close(&self, reason: &str) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.sent.lock().unwrap().push(Sent::Close(reason.to_string()));
            }
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }
    }
}
