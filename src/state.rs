//! # Application State
//!
//! Shared by every HTTP handler and device socket. Nothing in here is mutable:
//! all live device state sits behind the [`BridgeServer`] actor, so handlers
//! clone an address instead of taking a lock.
//!
//! ## Key Rust Concepts:
//!
//! ### `Addr<A>` (actor address)
//! - **Purpose**: a cloneable handle for sending messages to one actor
//! - **`send`**: returns a future with the handler's result, or a `MailboxError`
//!   if the actor has stopped
//! - **Ownership**: the actor's state is owned by the actor alone, so no
//!   `RwLock` is needed around it
//!
//! ### `Arc<AppConfig>`
//! - Read-only after startup, so sharing is a reference count bump per clone

use crate::config::AppConfig;     // Effective configuration
use crate::events::EventBus;      // Broadcast handle for bridge events
use crate::session::BridgeServer; // Actor owning every device session
use actix::Addr;
use std::sync::Arc;
use std::time::Instant;           // For tracking server uptime

/// State handed to every request through `web::Data<AppState>`.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: each HTTP worker thread gets its own clone; all
///   clones point at the same actor, config, and bus
#[derive(Clone)]
pub struct AppState {
    /// Mailbox of the actor owning all device sessions
    pub bridge: Addr<BridgeServer>,

    /// Configuration the server was started with
    pub config: Arc<AppConfig>,

    /// Handle for subscribing to bridge events
    pub bus: EventBus,

    pub start_time: Instant,
}

impl AppState {
    pub fn new(bridge: Addr<BridgeServer>, config: AppConfig, bus: EventBus) -> Self {
        Self {
            bridge,
            config: Arc::new(config),
            bus,
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
