use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the configuration the bridge is running with.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = &state.config;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port,
                "ws_path": config.server.ws_path
            },
            "bridge": config.bridge,
            "playback": config.playback,
            "device_defaults": config.device_defaults,
            "vad": config.vad
        }
    })))
}
