//! # Voice Device Bridge
//!
//! WebSocket bridge between ESP32 voice devices and a voice-assistant backend.
//!
//! ## Module Organization:
//! - [`protocol`]: binary frame codec and JSON control messages
//! - [`device`]: device identity, config, and the live registry
//! - [`audio`]: capture stream machine and playback pipeline
//! - [`session`]: connection lifecycle (handshake, liveness, teardown) and the bridge actor
//! - [`events`]: broadcast bus the bridge publishes to
//! - [`websocket`]: per-device socket actor
//! - [`handlers`] / [`health`]: HTTP query surface

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod handlers;
pub mod health;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;
pub mod websocket;

use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{web, App, HttpServer};
use state::AppState;
use std::net::SocketAddr;
use tracing_actix_web::TracingLogger;

/// Bind the HTTP server (device WebSocket plus query endpoints).
///
/// Returns the server, not yet polled, and the addresses it bound.
pub fn build_server(app_state: AppState, bind_addr: &str) -> std::io::Result<(Server, Vec<SocketAddr>)> {
    let ws_path = app_state.config.server.ws_path.clone();

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let ws_path = ws_path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(move |cfg| handlers::configure(cfg, &ws_path))
    })
    .bind(bind_addr)?;

    let addrs = server.addrs();
    Ok((server.run(), addrs))
}
