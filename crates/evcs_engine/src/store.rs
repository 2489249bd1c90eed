use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use evcs_core::charging::{ChargingDerivedState, ChargingObservation};
use evcs_core::scheduler::StationTarget;
use evcs_core::{Authorization, Telemetry};
use parking_lot::RwLock;

/// What the hub knows about one connected station beyond its identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationRecord {
    pub telemetry: Option<Telemetry>,
    pub derived: ChargingDerivedState,
    pub authorized: Authorization,
    pub stopping_since: Option<DateTime<Utc>>,
}

/// Per-station derived charging state, kept only while the station is registered.
#[derive(Default)]
pub struct ChargingStateStore {
    records: RwLock<HashMap<String, StationRecord>>,
}

impl ChargingStateStore {
    pub fn open(&self, client_id: &str) {
        self.records
            .write()
            .insert(client_id.to_string(), StationRecord::default());
    }

    pub fn purge(&self, client_id: &str) -> Option<StationRecord> {
        self.records.write().remove(client_id)
    }

    /// Store a telemetry frame and advance the charging state. Frames for a
    /// station without an open record are ignored.
    pub fn observe(
        &self,
        client_id: &str,
        telemetry: Telemetry,
        permitted: bool,
        amp_delta: u32,
        now: DateTime<Utc>,
    ) {
        let mut records = self.records.write();
        let Some(record) = records.get_mut(client_id) else {
            return;
        };
        let derived = std::mem::take(&mut record.derived);
        record.derived = derived.observe(ChargingObservation {
            ready_to_charge: telemetry.pilot_voltage.is_ready_to_charge(),
            permitted,
            measured_amps: telemetry.measured_amps(),
            authorized_amps: record.authorized.amps,
            amp_delta,
            now,
        });
        record.telemetry = Some(telemetry);
    }

    pub fn record(&self, client_id: &str) -> Option<StationRecord> {
        self.records.read().get(client_id).cloned()
    }

    pub fn telemetry(&self, client_id: &str) -> Option<Telemetry> {
        self.records
            .read()
            .get(client_id)
            .and_then(|record| record.telemetry.clone())
    }

    /// Record what a planning pass authorised.
    pub fn apply(&self, targets: &BTreeMap<String, StationTarget>) {
        let mut records = self.records.write();
        for (client_id, target) in targets {
            if let Some(record) = records.get_mut(client_id) {
                record.authorized = target.authorization;
                record.stopping_since = target.stopping_since;
            }
        }
    }
}
