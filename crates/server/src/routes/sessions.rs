//! Device session endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use shared::{DeviceRecord, SessionStatusResponse, StartSessionResponse};

use crate::{error::AppError, state::AppState};

/// Start pairing a device, returning the QR code to scan
/// POST /sessions/:owner/:device
pub async fn start_session(
    State(state): State<AppState>,
    Path((owner_id, device_id)): Path<(String, String)>,
) -> Result<Json<StartSessionResponse>, AppError> {
    let response = state.sessions.start(&owner_id, &device_id).await?;
    Ok(Json(response))
}

/// GET /sessions/:owner/:device
pub async fn session_status(
    State(state): State<AppState>,
    Path((owner_id, device_id)): Path<(String, String)>,
) -> Json<SessionStatusResponse> {
    let lifecycle = state.sessions.status(&owner_id, &device_id);
    Json(SessionStatusResponse {
        owner_id,
        device_id,
        state: lifecycle,
    })
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    /// Devices with a live connection right now
    pub live: Vec<String>,
    pub devices: Vec<DeviceRecord>,
}

/// GET /sessions/:owner
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Result<Json<DeviceListResponse>, AppError> {
    let devices = state.devices.devices_for_owner(&owner_id).await?;
    Ok(Json(DeviceListResponse {
        live: state.sessions.list(&owner_id),
        devices,
    }))
}

/// Log the device out and forget its credentials
/// DELETE /sessions/:owner/:device
pub async fn destroy_session(
    State(state): State<AppState>,
    Path((owner_id, device_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.sessions.destroy(&owner_id, &device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
