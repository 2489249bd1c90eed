use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator;
use crate::{EvChargingMode, LoadSharingPriority};

/// Power connection id given to stations that are not listed in the settings.
pub const UNKNOWN_POWER_CONNECTION: &str = "unknown";

const MAX_CHARGE_RATE: u32 = 32;
const MIN_CHARGE_RATE: u32 = 6;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Power connection {id} has capacity {capacity}A, expected 1..=1000")]
    CapacityOutOfRange { id: String, capacity: u32 },
    #[error("Lowest charge rate {amps}A is outside 6..=32")]
    LowestChargeRateOutOfRange { amps: u32 },
    #[error("Charger {name} has charge rate limit {amps}A, expected {min}..=32")]
    ChargeRateLimitOutOfRange { name: String, amps: u32, min: u32 },
    #[error("chargingEndingAmpDelta must be at least 1A")]
    AmpDeltaZero,
    #[error("Power connection {id} uses unknown load sharing algorithm {algorithm}")]
    UnknownAlgorithm { id: String, algorithm: String },
    #[error("Charger {name} references unknown power connection {power_connection}")]
    UnknownPowerConnection {
        name: String,
        power_connection: String,
    },
    #[error("Charger name {name} is used more than once")]
    DuplicateChargerName { name: String },
    #[error("No charger named {name}")]
    ChargerNotFound { name: String },
}

/// EV charging settings, read as one snapshot per reallocation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EvSettings {
    #[serde(rename = "stayInChargingForMS")]
    pub stay_in_charging_for_ms: u64,
    pub charging_ending_amp_delta: u32,
    #[serde(rename = "stayInStoppingChargingForMS")]
    pub stay_in_stopping_charging_for_ms: u64,
    pub assume_station_lost_after_ms: u64,
    pub lowest_charge_rate: u32,
    pub power_connections: HashMap<String, PowerConnectionSettings>,
    /// Keyed by the serial number the station sends in its handshake.
    pub chargers: HashMap<String, ChargerSettings>,
}

impl Default for EvSettings {
    fn default() -> Self {
        EvSettings {
            stay_in_charging_for_ms: 30_000,
            charging_ending_amp_delta: 2,
            stay_in_stopping_charging_for_ms: 15_000,
            assume_station_lost_after_ms: 300_000,
            lowest_charge_rate: MIN_CHARGE_RATE,
            power_connections: HashMap::new(),
            chargers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PowerConnectionSettings {
    pub name: String,
    /// Amps the circuit can deliver to all of its stations together.
    pub available_capacity: u32,
    pub load_sharing_algorithm: String,
}

impl Default for PowerConnectionSettings {
    fn default() -> Self {
        PowerConnectionSettings {
            name: "unknown".into(),
            available_capacity: 32,
            load_sharing_algorithm: allocator::DEFAULT_ALGORITHM.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChargerSettings {
    pub serial_number: String,
    /// Stable client id used everywhere else.
    pub name: String,
    pub display_name: String,
    pub power_connection: String,
    #[serde(default)]
    pub ev_charging_mode: EvChargingMode,
    #[serde(default)]
    pub priority: LoadSharingPriority,
    #[serde(default = "default_charge_rate_limit")]
    pub charge_rate_limit: u32,
    #[serde(default = "default_required_cheap_hours")]
    pub required_cheap_hours: u32,
}

fn default_charge_rate_limit() -> u32 {
    MAX_CHARGE_RATE
}

fn default_required_cheap_hours() -> u32 {
    4
}

impl ChargerSettings {
    /// Settings for a station whose serial number is not configured.
    ///
    /// It lands on the unknown power connection, which has no capacity.
    pub fn unregistered(serial_number: &str) -> Self {
        ChargerSettings {
            serial_number: serial_number.into(),
            name: serial_number.into(),
            display_name: serial_number.into(),
            power_connection: UNKNOWN_POWER_CONNECTION.into(),
            ev_charging_mode: EvChargingMode::Off,
            priority: LoadSharingPriority::Normal,
            charge_rate_limit: MAX_CHARGE_RATE,
            required_cheap_hours: default_required_cheap_hours(),
        }
    }
}

impl EvSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CHARGE_RATE..=MAX_CHARGE_RATE).contains(&self.lowest_charge_rate) {
            return Err(ConfigError::LowestChargeRateOutOfRange {
                amps: self.lowest_charge_rate,
            });
        }
        if self.charging_ending_amp_delta == 0 {
            return Err(ConfigError::AmpDeltaZero);
        }

        for (id, connection) in &self.power_connections {
            if !(1..=1000).contains(&connection.available_capacity) {
                return Err(ConfigError::CapacityOutOfRange {
                    id: id.clone(),
                    capacity: connection.available_capacity,
                });
            }
            if allocator::strategy_by_id(&connection.load_sharing_algorithm).is_none() {
                return Err(ConfigError::UnknownAlgorithm {
                    id: id.clone(),
                    algorithm: connection.load_sharing_algorithm.clone(),
                });
            }
        }

        let mut names = HashSet::new();
        for charger in self.chargers.values() {
            if !names.insert(charger.name.as_str()) {
                return Err(ConfigError::DuplicateChargerName {
                    name: charger.name.clone(),
                });
            }
            if !self.power_connections.contains_key(&charger.power_connection) {
                return Err(ConfigError::UnknownPowerConnection {
                    name: charger.name.clone(),
                    power_connection: charger.power_connection.clone(),
                });
            }
            if !(self.lowest_charge_rate..=MAX_CHARGE_RATE).contains(&charger.charge_rate_limit) {
                return Err(ConfigError::ChargeRateLimitOutOfRange {
                    name: charger.name.clone(),
                    amps: charger.charge_rate_limit,
                    min: self.lowest_charge_rate,
                });
            }
        }
        Ok(())
    }

    pub fn charger_by_serial(&self, serial_number: &str) -> Option<&ChargerSettings> {
        self.chargers.get(serial_number)
    }

    pub fn charger(&self, client_id: &str) -> Option<&ChargerSettings> {
        self.chargers.values().find(|charger| charger.name == client_id)
    }

    pub fn charger_mut(&mut self, client_id: &str) -> Result<&mut ChargerSettings, ConfigError> {
        self.chargers
            .values_mut()
            .find(|charger| charger.name == client_id)
            .ok_or_else(|| ConfigError::ChargerNotFound {
                name: client_id.into(),
            })
    }

    /// Capacity of a power connection; unknown connections have none.
    pub fn available_capacity(&self, power_connection_id: &str) -> u32 {
        self.power_connections
            .get(power_connection_id)
            .map_or(0, |connection| connection.available_capacity)
    }

    pub fn load_sharing_algorithm(&self, power_connection_id: &str) -> &str {
        self.power_connections
            .get(power_connection_id)
            .map_or(allocator::DEFAULT_ALGORITHM, |connection| {
                connection.load_sharing_algorithm.as_str()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn garage_settings() -> EvSettings {
        let mut settings = EvSettings::default();
        settings.power_connections.insert(
            "garage".into(),
            PowerConnectionSettings {
                name: "Garage".into(),
                available_capacity: 32,
                load_sharing_algorithm: "PriorityLoadSharing".into(),
            },
        );
        settings.chargers.insert(
            "00aa".into(),
            ChargerSettings {
                serial_number: "00aa".into(),
                name: "left".into(),
                display_name: "Left".into(),
                power_connection: "garage".into(),
                ev_charging_mode: EvChargingMode::On,
                priority: LoadSharingPriority::Normal,
                charge_rate_limit: 32,
                required_cheap_hours: 4,
            },
        );
        settings
    }

    #[test]
    fn test_defaults() {
        let settings = EvSettings::default();
        assert_eq!(settings.stay_in_charging_for_ms, 30_000);
        assert_eq!(settings.charging_ending_amp_delta, 2);
        assert_eq!(settings.stay_in_stopping_charging_for_ms, 15_000);
        assert_eq!(settings.assume_station_lost_after_ms, 300_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_json_deserialization() {
        let json = r#"
        {
          "stayInChargingForMS": 20000,
          "powerConnections": {
            "garage": {"name": "Garage", "availableCapacity": 25}
          },
          "chargers": {
            "00aa": {
              "serialNumber": "00aa",
              "name": "left",
              "displayName": "Left",
              "powerConnection": "garage",
              "evChargingMode": "chargeDuringCheapHours",
              "priority": "HIGH"
            }
          }
        }
        "#;

        let settings: EvSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.stay_in_charging_for_ms, 20_000);
        assert_eq!(settings.stay_in_stopping_charging_for_ms, 15_000);
        assert_eq!(settings.available_capacity("garage"), 25);
        assert_eq!(settings.load_sharing_algorithm("garage"), "PriorityLoadSharing");
        let charger = settings.charger("left").unwrap();
        assert_eq!(charger.charge_rate_limit, 32);
        assert_eq!(charger.priority, LoadSharingPriority::High);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_rejects_capacity_out_of_range() {
        let mut settings = garage_settings();
        settings
            .power_connections
            .get_mut("garage")
            .unwrap()
            .available_capacity = 0;
        assert_eq!(
            settings.validate(),
            Err(ConfigError::CapacityOutOfRange {
                id: "garage".into(),
                capacity: 0
            })
        );
    }

    #[test]
    fn test_rejects_rate_limit_below_lowest() {
        let mut settings = garage_settings();
        settings.charger_mut("left").unwrap().charge_rate_limit = 5;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ChargeRateLimitOutOfRange { amps: 5, .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_references() {
        let mut settings = garage_settings();
        settings.charger_mut("left").unwrap().power_connection = "attic".into();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnknownPowerConnection { .. })
        ));

        let mut settings = garage_settings();
        settings
            .power_connections
            .get_mut("garage")
            .unwrap()
            .load_sharing_algorithm = "FirstComeFirstServed".into();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnknownAlgorithm { .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut settings = garage_settings();
        let mut twin = settings.charger("left").unwrap().clone();
        twin.serial_number = "00bb".into();
        settings.chargers.insert("00bb".into(), twin);
        assert_eq!(
            settings.validate(),
            Err(ConfigError::DuplicateChargerName {
                name: "left".into()
            })
        );
    }

    #[test]
    fn test_unknown_connection_has_no_capacity() {
        let settings = garage_settings();
        assert_eq!(settings.available_capacity(UNKNOWN_POWER_CONNECTION), 0);
        let unregistered = ChargerSettings::unregistered("ffee");
        assert_eq!(unregistered.power_connection, UNKNOWN_POWER_CONNECTION);
        assert_eq!(unregistered.ev_charging_mode, EvChargingMode::Off);
    }
}
