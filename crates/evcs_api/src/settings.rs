use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use evcs_core::EvSettings;
use serde::{Deserialize, Serialize};

use crate::{AppState, engine_error_to_response};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRequest {
    pub acceptable: bool,
}

/// Current EV settings snapshot
pub async fn get_settings(State(app_state): State<AppState>) -> Json<EvSettings> {
    Json(app_state.engine.settings().as_ref().clone())
}

/// Replace the EV settings; invalid settings leave the current ones in place
pub async fn replace_settings(
    State(app_state): State<AppState>,
    Json(settings): Json<EvSettings>,
) -> Response {
    match app_state.engine.replace_settings(settings) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => {
            tracing::warn!(%error, "Rejected settings update");
            engine_error_to_response(error)
        }
    }
}

pub async fn get_price(State(app_state): State<AppState>) -> Json<PriceRequest> {
    Json(PriceRequest {
        acceptable: app_state.price.get(),
    })
}

/// Switch the price signal used by stations charging during cheap hours
pub async fn set_price(
    State(app_state): State<AppState>,
    Json(payload): Json<PriceRequest>,
) -> StatusCode {
    tracing::info!(acceptable = payload.acceptable, "Price signal changed");
    app_state.price.set(payload.acceptable);
    StatusCode::NO_CONTENT
}
