//! HTTP API of the charging hub.
//!
//! Thin handlers over [`Engine`]: station listing and telemetry, per-station
//! mode, priority and rate limit, firmware upload, settings, the price
//! signal and a server-sent event stream.

mod events;
mod settings;
mod station;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use evcs_engine::{Engine, EngineError, StaticPriceSignal};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

/// Firmware images are sent in one request body.
const FIRMWARE_BODY_LIMIT: usize = 8 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub price: Arc<StaticPriceSignal>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn engine_error_to_response(error: EngineError) -> Response {
    let status = match error {
        EngineError::UnknownStation { .. } => StatusCode::NOT_FOUND,
        EngineError::InvalidSettings(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(status, error.to_string())
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Create the application router with all endpoints
pub fn create_app(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/clients", get(station::list_clients))
        .route("/clients/{client_id}/data", get(station::get_data))
        .route(
            "/clients/{client_id}/mode",
            get(station::get_mode).put(station::update_mode),
        )
        .route("/clients/{client_id}/priority", put(station::set_priority))
        .route(
            "/clients/{client_id}/charge-rate-limit",
            put(station::set_charge_rate_limit),
        )
        .route(
            "/clients/{client_id}/firmware",
            post(station::upload_firmware)
                .layer(axum::extract::DefaultBodyLimit::max(FIRMWARE_BODY_LIMIT)),
        )
        .route("/stations", get(station::list_stations))
        .route(
            "/settings",
            get(settings::get_settings).put(settings::replace_settings),
        )
        .route("/price", get(settings::get_price).put(settings::set_price))
        .route("/events", get(events::stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}


#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::util::ServiceExt;

    use crate::test_support::{connect_left, test_state};

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_app(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_integration_mode_change_reaches_snapshot() {
        let state = test_state();
        connect_left(&state).await;
        let app = create_app(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/clients/left/mode")
                    .method("PUT")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"mode":"chargeDuringCheapHours"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/stations")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stations: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stations[0]["client"]["clientId"], "left");
        assert_eq!(
            stations[0]["settings"]["evChargingMode"],
            "chargeDuringCheapHours"
        );
        assert_eq!(stations[0]["status"]["state"], "connectedIdle");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let app = create_app(test_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/charge")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
