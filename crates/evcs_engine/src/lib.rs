//! Station registry, charging state and load-sharing control loop.
//!
//! The [`Engine`] is the service the station link and the HTTP surface talk
//! to. Telemetry from a station is folded into its charging state and
//! triggers a planning pass over the station's power connection; the
//! resulting commands go back out through the station handles.

mod clock;
mod control;
mod events;
mod price;
mod registry;
mod settings_store;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use evcs_core::charging::station_status;
use evcs_core::scheduler::{
    self, CircuitLimits, CircuitPlan, ReportedState, StationInput, StationTarget,
};
use evcs_core::{
    ChargerSettings, ConfigError, EvChargingMode, EvSettings, LoadSharingPriority, StationClient,
    Telemetry,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::clock::{Clock, SystemClock};
pub use crate::control::DispatchReport;
pub use crate::events::{EngineEvent, EventBus, StationSnapshot};
pub use crate::price::{PriceSignal, StaticPriceSignal};
pub use crate::registry::{RegisteredStation, StationHandle, StationRegistry};
pub use crate::settings_store::SettingsStore;
pub use crate::store::{ChargingStateStore, StationRecord};

use crate::control::CircuitLocks;

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Station {client_id} is not known")]
    UnknownStation { client_id: String },
    #[error(transparent)]
    InvalidSettings(#[from] ConfigError),
}

pub struct Engine {
    registry: StationRegistry,
    store: ChargingStateStore,
    settings: SettingsStore,
    locks: CircuitLocks,
    events: EventBus,
    price: Arc<dyn PriceSignal>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(settings: EvSettings, price: Arc<dyn PriceSignal>) -> Result<Self, EngineError> {
        Self::with_clock(settings, price, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: EvSettings,
        price: Arc<dyn PriceSignal>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        Ok(Engine {
            registry: StationRegistry::default(),
            store: ChargingStateStore::default(),
            settings: SettingsStore::new(settings)?,
            locks: CircuitLocks::default(),
            events: EventBus::new(EVENT_CAPACITY),
            price,
            clock,
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Map a handshake serial number to the station's configured identity.
    pub fn identify(&self, serial_number: &str, firmware_version: u8, peer: SocketAddr) -> StationClient {
        let settings = self.settings.snapshot();
        let charger = match settings.charger_by_serial(serial_number) {
            Some(charger) => charger.clone(),
            None => {
                warn!(serial_number, "Station is not configured and will not get any current");
                ChargerSettings::unregistered(serial_number)
            }
        };
        StationClient {
            client_id: charger.name,
            display_name: charger.display_name,
            addr: peer.ip().to_string(),
            port: peer.port(),
            firmware_version,
            power_connection_id: charger.power_connection,
            connected_at: self.clock.now(),
        }
    }

    pub fn station_connected(&self, client: StationClient, handle: Arc<dyn StationHandle>) {
        let connection_id = handle.connection_id();
        info!(
            client_id = %client.client_id,
            circuit = %client.power_connection_id,
            %connection_id,
            firmware_version = client.firmware_version,
            "Station connected"
        );
        if let Some(previous) = self.registry.insert(client.clone(), handle) {
            info!(
                client_id = %client.client_id,
                connection_id = %previous.handle.connection_id(),
                "Closing superseded connection"
            );
            previous.handle.close();
        }
        self.store.open(&client.client_id);
        self.events.publish(EngineEvent::StationConnected { client });
    }

    /// Forget a station, unless it already reconnected through another connection.
    pub fn station_disconnected(&self, client_id: &str, connection_id: Uuid) -> bool {
        if self.registry.remove(client_id, connection_id).is_none() {
            return false;
        }
        self.store.purge(client_id);
        info!(client_id, %connection_id, "Station disconnected");
        self.events.publish(EngineEvent::StationDisconnected {
            client_id: client_id.to_string(),
        });
        true
    }

    pub fn update_firmware_version(&self, client_id: &str, firmware_version: u8) {
        self.registry
            .update_firmware_version(client_id, firmware_version);
    }

    /// Fold a telemetry frame into the station's state and reallocate its circuit.
    pub async fn on_telemetry(
        &self,
        client_id: &str,
        connection_id: Uuid,
        telemetry: Telemetry,
    ) -> DispatchReport {
        let Some(station) = self.registry.get(client_id) else {
            debug!(client_id, "Dropping telemetry of unregistered station");
            return DispatchReport::default();
        };
        if station.handle.connection_id() != connection_id {
            debug!(client_id, %connection_id, "Dropping telemetry of superseded connection");
            return DispatchReport::default();
        }

        for line in &telemetry.log_messages {
            info!(target: "station_log", client_id, "{line}");
        }
        debug!(
            client_id,
            pilot = ?telemetry.pilot_voltage,
            contactor_on = telemetry.contactor_on,
            pwm_percent = telemetry.pwm_percent,
            measured_amps = telemetry.measured_amps(),
            "Telemetry received"
        );

        let settings = self.settings.snapshot();
        let circuit = station.client.power_connection_id.as_str();
        let now = self.clock.now();
        let permitted = self.permits_charging(&charger_settings(&settings, client_id));

        let (plan, lost) = {
            let lock = self.locks.lock_for(circuit);
            let _guard = lock.lock();
            self.store.observe(
                client_id,
                telemetry,
                permitted,
                settings.charging_ending_amp_delta,
                now,
            );
            self.plan_locked(&settings, circuit, now)
        };

        for lost_station in lost {
            warn!(
                client_id = %lost_station.client.client_id,
                circuit,
                "Station lost, closing connection"
            );
            lost_station.handle.close();
        }
        if let Some(snapshot) = self.snapshot(client_id) {
            self.events.publish(EngineEvent::StationData {
                snapshot: Box::new(snapshot),
            });
        }

        control::dispatch(&self.registry, plan.commands).await
    }

    /// Plan a circuit; the caller holds the circuit lock.
    fn plan_locked(
        &self,
        settings: &EvSettings,
        circuit: &str,
        now: DateTime<Utc>,
    ) -> (CircuitPlan, Vec<RegisteredStation>) {
        let limits = CircuitLimits::for_circuit(settings, circuit);
        let lost_after = TimeDelta::milliseconds(settings.assume_station_lost_after_ms as i64);
        let mut lost = Vec::new();
        let mut inputs = Vec::new();

        for member in self.registry.members(circuit) {
            let client_id = member.client.client_id.as_str();
            let Some(record) = self.store.record(client_id) else {
                continue;
            };
            let Some(telemetry) = &record.telemetry else {
                continue;
            };
            if now - telemetry.received_at > lost_after {
                lost.push(member);
                continue;
            }
            let charger = charger_settings(settings, client_id);
            inputs.push(StationInput {
                client_id: client_id.to_string(),
                priority: charger.priority,
                charge_rate_limit: charger.charge_rate_limit,
                permitted: self.permits_charging(&charger),
                reported: ReportedState::from(telemetry),
                derived: record.derived.clone(),
                authorized: record.authorized,
                stopping_since: record.stopping_since,
            });
        }

        let plan = scheduler::plan_circuit(&limits, &inputs, now);
        let mut applied = plan.targets.clone();
        for member in &lost {
            applied.insert(member.client.client_id.clone(), StationTarget::OFF);
        }
        self.store.apply(&applied);
        debug!(
            circuit,
            capacity = limits.capacity,
            authorized = plan.authorized_total(),
            commands = plan.commands.len(),
            "Circuit planned"
        );
        (plan, lost)
    }

    fn permits_charging(&self, charger: &ChargerSettings) -> bool {
        match charger.ev_charging_mode {
            EvChargingMode::On => true,
            EvChargingMode::Off => false,
            EvChargingMode::ChargeDuringCheapHours => self
                .price
                .is_price_acceptable(&charger.name, charger.required_cheap_hours),
        }
    }

    pub fn connected_clients(&self) -> Vec<StationClient> {
        self.registry.clients()
    }

    /// Latest telemetry of a connected station.
    pub fn data(&self, client_id: &str) -> Option<Telemetry> {
        self.store.telemetry(client_id)
    }

    pub fn snapshot(&self, client_id: &str) -> Option<StationSnapshot> {
        let station = self.registry.get(client_id)?;
        let record = self.store.record(client_id).unwrap_or_default();
        let settings = self.settings.snapshot();
        Some(StationSnapshot {
            status: station_status(
                record.telemetry.as_ref(),
                &record.derived,
                record.stopping_since,
            ),
            three_phase: record
                .telemetry
                .as_ref()
                .is_some_and(Telemetry::uses_three_phase),
            settings: charger_settings(&settings, client_id),
            client: station.client,
            telemetry: record.telemetry,
            charging: record.derived,
            authorization: record.authorized,
        })
    }

    pub fn snapshots(&self) -> Vec<StationSnapshot> {
        self.connected_clients()
            .iter()
            .filter_map(|client| self.snapshot(&client.client_id))
            .collect()
    }

    /// Change the charging mode and ask the station for fresh telemetry so the
    /// change takes effect right away.
    pub async fn update_mode(&self, client_id: &str, mode: EvChargingMode) -> Result<(), EngineError> {
        self.update_charger(client_id, |charger| charger.ev_charging_mode = mode)?;
        info!(client_id, ?mode, "Charging mode changed");
        if let Some(handle) = self.registry.handle(client_id) {
            if !handle.request_data().await {
                warn!(client_id, "Could not request data after mode change");
            }
        }
        Ok(())
    }

    pub fn mode(&self, client_id: &str) -> Result<EvChargingMode, EngineError> {
        match self.settings.snapshot().charger(client_id) {
            Some(charger) => Ok(charger.ev_charging_mode),
            // connected but not configured
            None if self.registry.get(client_id).is_some() => Ok(EvChargingMode::Off),
            None => Err(EngineError::UnknownStation {
                client_id: client_id.to_string(),
            }),
        }
    }

    pub fn set_priority(&self, client_id: &str, priority: LoadSharingPriority) -> Result<(), EngineError> {
        self.update_charger(client_id, |charger| charger.priority = priority)?;
        info!(client_id, ?priority, "Load sharing priority changed");
        Ok(())
    }

    pub fn set_charge_rate_limit(&self, client_id: &str, amps: u32) -> Result<(), EngineError> {
        self.update_charger(client_id, |charger| charger.charge_rate_limit = amps)?;
        info!(client_id, amps, "Charge rate limit changed");
        Ok(())
    }

    fn update_charger<F>(&self, client_id: &str, change: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut ChargerSettings),
    {
        self.settings
            .update(|settings| {
                change(settings.charger_mut(client_id)?);
                Ok(())
            })
            .map_err(|error| match error {
                ConfigError::ChargerNotFound { name } => EngineError::UnknownStation { client_id: name },
                other => EngineError::InvalidSettings(other),
            })
    }

    pub async fn upload_firmware_to_client(&self, client_id: &str, image: Bytes) -> bool {
        let Some(handle) = self.registry.handle(client_id) else {
            warn!(client_id, "Firmware upload to unknown station");
            return false;
        };
        info!(client_id, bytes = image.len(), "Uploading firmware");
        let uploaded = handle.upload_firmware_and_reboot(image).await;
        if uploaded {
            info!(client_id, "Firmware uploaded, station is rebooting");
        } else {
            warn!(client_id, "Firmware upload failed");
        }
        uploaded
    }

    pub fn settings(&self) -> Arc<EvSettings> {
        self.settings.snapshot()
    }

    pub fn replace_settings(&self, settings: EvSettings) -> Result<(), EngineError> {
        self.settings.replace(settings)?;
        info!("EV settings replaced");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

fn charger_settings(settings: &EvSettings, client_id: &str) -> ChargerSettings {
    settings
        .charger(client_id)
        .cloned()
        .unwrap_or_else(|| ChargerSettings::unregistered(client_id))
}
