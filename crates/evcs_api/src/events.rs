use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use evcs_engine::EngineEvent;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

use crate::AppState;

fn event_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::StationConnected { .. } => "stationConnected",
        EngineEvent::StationDisconnected { .. } => "stationDisconnected",
        EngineEvent::StationData { .. } => "stationData",
    }
}

fn to_sse(event: &EngineEvent) -> Option<Event> {
    match Event::default().event(event_name(event)).json_data(event) {
        Ok(sse) => Some(sse),
        Err(error) => {
            warn!(%error, "Could not encode event");
            None
        }
    }
}

/// Engine events as server-sent events
pub async fn stream_events(
    State(app_state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    trace!("Event stream connected");

    let stream = BroadcastStream::new(app_state.engine.subscribe()).filter_map(|event| match event {
        Ok(event) => to_sse(&event).map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "Event stream lagging, events dropped");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
