//! Connected stations and the handles used to command them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use evcs_core::StationClient;
use parking_lot::RwLock;
use uuid::Uuid;

/// Command side of one live station connection.
///
/// Every command is a request/response exchange with the device. A `false`
/// result means the exchange failed; the connection has then already been
/// torn down, except for a firmware image the device rejected.
#[async_trait]
pub trait StationHandle: Send + Sync {
    /// Identifies the connection, a reconnecting station gets a new one.
    fn connection_id(&self) -> Uuid;

    async fn set_contactor_state(&self, on: bool) -> bool;

    async fn set_pwm_percent(&self, duty: u8) -> bool;

    async fn upload_firmware_and_reboot(&self, image: Bytes) -> bool;

    /// Ask for an immediate telemetry push.
    async fn request_data(&self) -> bool;

    /// Tear the connection down without waiting for it.
    fn close(&self);
}

#[derive(Clone)]
pub struct RegisteredStation {
    pub client: StationClient,
    pub handle: Arc<dyn StationHandle>,
}

#[derive(Default)]
pub struct StationRegistry {
    stations: RwLock<HashMap<String, RegisteredStation>>,
}

impl StationRegistry {
    /// Register a station, returning the entry it replaced.
    pub fn insert(
        &self,
        client: StationClient,
        handle: Arc<dyn StationHandle>,
    ) -> Option<RegisteredStation> {
        self.stations
            .write()
            .insert(client.client_id.clone(), RegisteredStation { client, handle })
    }

    /// Remove a station if it is still registered through `connection_id`.
    ///
    /// A connection that lost a race against the station reconnecting must
    /// not unregister the newer connection.
    pub fn remove(&self, client_id: &str, connection_id: Uuid) -> Option<RegisteredStation> {
        let mut stations = self.stations.write();
        match stations.get(client_id) {
            Some(station) if station.handle.connection_id() == connection_id => {
                stations.remove(client_id)
            }
            _ => None,
        }
    }

    pub fn get(&self, client_id: &str) -> Option<RegisteredStation> {
        self.stations.read().get(client_id).cloned()
    }

    pub fn handle(&self, client_id: &str) -> Option<Arc<dyn StationHandle>> {
        self.stations
            .read()
            .get(client_id)
            .map(|station| station.handle.clone())
    }

    /// Connected clients ordered by client id.
    pub fn clients(&self) -> Vec<StationClient> {
        let mut clients: Vec<StationClient> = self
            .stations
            .read()
            .values()
            .map(|station| station.client.clone())
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        clients
    }

    /// Stations plugged into one power connection.
    pub fn members(&self, power_connection_id: &str) -> Vec<RegisteredStation> {
        self.stations
            .read()
            .values()
            .filter(|station| station.client.power_connection_id == power_connection_id)
            .cloned()
            .collect()
    }

    pub fn update_firmware_version(&self, client_id: &str, firmware_version: u8) {
        if let Some(station) = self.stations.write().get_mut(client_id) {
            station.client.firmware_version = firmware_version;
        }
    }
}
