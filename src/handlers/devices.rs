//! Operator-facing device endpoints. Every request is answered by the bridge actor.

use crate::error::{AppError, AppResult};
use crate::protocol::messages::ConfigMessage;
use crate::session::server::{GetActiveStream, GetCapabilities, GetDevice, ListConnected, UpdateDeviceConfig};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/devices`
pub async fn list_devices(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let devices = state.bridge.send(ListConnected).await?;

    Ok(HttpResponse::Ok().json(json!({
        "count": devices.len(),
        "devices": devices,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `GET /api/v1/devices/{id}`
pub async fn get_device(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let device_id = path.into_inner();
    let device = state
        .bridge
        .send(GetDevice(device_id.clone()))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Device {} not found", device_id)))?;

    Ok(HttpResponse::Ok().json(device))
}

/// `GET /api/v1/devices/{id}/capabilities`
///
/// What the device announced in its handshake, or `null` if it sent nothing usable.
pub async fn get_device_capabilities(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let device_id = path.into_inner();
    if state.bridge.send(GetDevice(device_id.clone())).await?.is_none() {
        return Err(AppError::NotFound(format!("Device {} not found", device_id)));
    }
    let capabilities = state.bridge.send(GetCapabilities(device_id.clone())).await?;

    Ok(HttpResponse::Ok().json(json!({
        "deviceId": device_id,
        "capabilities": capabilities
    })))
}

/// `GET /api/v1/devices/{id}/stream`
///
/// The recording in progress, or `null` when the device is idle.
pub async fn get_active_stream(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let device_id = path.into_inner();
    if state.bridge.send(GetDevice(device_id.clone())).await?.is_none() {
        return Err(AppError::NotFound(format!("Device {} not found", device_id)));
    }
    let stream = state.bridge.send(GetActiveStream(device_id.clone())).await?;

    Ok(HttpResponse::Ok().json(json!({
        "deviceId": device_id,
        "activeStream": stream
    })))
}

/// `PUT /api/v1/devices/{id}/config`
///
/// Merges the partial config into the device entry and pushes it to the device.
pub async fn update_device_config(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ConfigMessage>,
) -> AppResult<HttpResponse> {
    let device_id = path.into_inner();
    let patch = body.into_inner();
    if patch == ConfigMessage::default() {
        return Err(AppError::BadRequest("Config update has no fields".to_string()));
    }

    let pushed = state
        .bridge
        .send(UpdateDeviceConfig {
            device_id: device_id.clone(),
            patch,
        })
        .await?;

    if !pushed {
        return Err(AppError::NotFound(format!("Device {} is not online", device_id)));
    }

    let device = state.bridge.send(GetDevice(device_id.clone())).await?;
    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "deviceId": device_id,
        "config": device.map(|d| d.config)
    })))
}
