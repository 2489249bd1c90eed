use evcs_core::charging::ChargingDerivedState;
use evcs_core::{Authorization, ChargerSettings, StationClient, StationStatus, Telemetry};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything the hub knows about a station at one instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSnapshot {
    pub client: StationClient,
    pub telemetry: Option<Telemetry>,
    pub status: StationStatus,
    pub charging: ChargingDerivedState,
    pub authorization: Authorization,
    pub settings: ChargerSettings,
    pub three_phase: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    StationConnected { client: StationClient },
    #[serde(rename_all = "camelCase")]
    StationDisconnected { client_id: String },
    StationData { snapshot: Box<StationSnapshot> },
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Publish to whoever listens; having no subscriber is fine.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
