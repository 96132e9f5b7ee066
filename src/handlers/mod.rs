//! # HTTP Request Handlers
//!
//! - [`devices`]: connected devices, capabilities, active streams, config push
//! - [`config`]: effective server configuration
//!
//! The device WebSocket endpoint lives in [`crate::websocket`].

pub mod config;
pub mod devices;

pub use config::*;
pub use devices::*;

use crate::health;
use crate::websocket;
use actix_web::web;

/// Register every route on an app.
pub fn configure(cfg: &mut web::ServiceConfig, ws_path: &str) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health::health_check))
            .route("/config", web::get().to(get_config))
            .route("/devices", web::get().to(list_devices))
            .route("/devices/{id}", web::get().to(get_device))
            .route("/devices/{id}/capabilities", web::get().to(get_device_capabilities))
            .route("/devices/{id}/stream", web::get().to(get_active_stream))
            .route("/devices/{id}/config", web::put().to(update_device_config)),
    )
    .route("/health", web::get().to(health::health_check))
    .route(ws_path, web::get().to(websocket::device_websocket));
}
