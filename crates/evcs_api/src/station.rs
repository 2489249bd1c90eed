use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use evcs_core::{EvChargingMode, LoadSharingPriority, StationClient, Telemetry};
use evcs_engine::StationSnapshot;
use serde::{Deserialize, Serialize};

use crate::{AppState, engine_error_to_response, error_response};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeRequest {
    pub mode: EvChargingMode,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityRequest {
    pub priority: LoadSharingPriority,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRateLimitRequest {
    pub amps: u32,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareResponse {
    pub uploaded: bool,
}

/// Stations connected right now
pub async fn list_clients(State(app_state): State<AppState>) -> Json<Vec<StationClient>> {
    Json(app_state.engine.connected_clients())
}

/// Full snapshot of every connected station
pub async fn list_stations(State(app_state): State<AppState>) -> Json<Vec<StationSnapshot>> {
    Json(app_state.engine.snapshots())
}

/// Latest telemetry of one station
pub async fn get_data(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<Telemetry>, Response> {
    app_state.engine.data(&client_id).map(Json).ok_or_else(|| {
        error_response(
            StatusCode::NOT_FOUND,
            format!("No data for station {client_id}"),
        )
    })
}

pub async fn get_mode(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    match app_state.engine.mode(&client_id) {
        Ok(mode) => Json(ModeRequest { mode }).into_response(),
        Err(error) => engine_error_to_response(error),
    }
}

pub async fn update_mode(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
    Json(payload): Json<ModeRequest>,
) -> Response {
    tracing::info!(client_id, mode = ?payload.mode, "Mode change requested");
    match app_state.engine.update_mode(&client_id, payload.mode).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => engine_error_to_response(error),
    }
}

pub async fn set_priority(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
    Json(payload): Json<PriorityRequest>,
) -> Response {
    match app_state.engine.set_priority(&client_id, payload.priority) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => engine_error_to_response(error),
    }
}

pub async fn set_charge_rate_limit(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
    Json(payload): Json<ChargeRateLimitRequest>,
) -> Response {
    match app_state
        .engine
        .set_charge_rate_limit(&client_id, payload.amps)
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => engine_error_to_response(error),
    }
}

/// Upload a raw firmware image; the station reboots into it
pub async fn upload_firmware(
    State(app_state): State<AppState>,
    Path(client_id): Path<String>,
    image: Bytes,
) -> Response {
    if app_state.engine.snapshot(&client_id).is_none() {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("Station {client_id} is not connected"),
        );
    }
    if image.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Firmware image is empty");
    }
    let uploaded = app_state
        .engine
        .upload_firmware_to_client(&client_id, image)
        .await;
    let status = if uploaded {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(FirmwareResponse { uploaded })).into_response()
}
