//! # Health Check
//!
//! `GET /health` and `GET /api/v1/health`. Reports `healthy` while the bridge
//! actor answers, `degraded` (503) once it is gone.

use crate::session::server::{ListConnected, SessionCount};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let connected = state.bridge.send(ListConnected).await.map(|devices| devices.len());
    let sessions = state.bridge.send(SessionCount).await;

    let body = |status: &str, connected: Option<usize>, sessions: Option<usize>| {
        json!({
            "status": status,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "uptime_seconds": state.get_uptime_seconds(),
            "service": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "ws_path": state.config.server.ws_path
            },
            "devices": {
                "connected": connected,
                "sessions": sessions
            },
            "event_subscribers": state.bus.subscriber_count()
        })
    };

    match (connected, sessions) {
        (Ok(connected), Ok(sessions)) => HttpResponse::Ok().json(body("healthy", Some(connected), Some(sessions))),
        _ => HttpResponse::ServiceUnavailable().json(body("degraded", None, None)),
    }
}
