use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a charging station that completed the link handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StationClient {
    pub client_id: String,
    pub display_name: String,
    pub addr: String,
    pub port: u16,
    pub firmware_version: u8,
    pub power_connection_id: String,
    pub connected_at: DateTime<Utc>,
}

/// Control pilot voltage class as reported by the station.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PilotVoltage {
    /// 12V, no vehicle on the cable
    NoVehicle,
    /// 9V, vehicle connected but not requesting power
    VehicleConnected,
    /// 6V, vehicle ready to charge
    ReadyToCharge,
    /// 3V, vehicle ready to charge and asking for ventilation
    ReadyToChargeVentilated,
    Fault,
}

impl PilotVoltage {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PilotVoltage::NoVehicle),
            1 => Some(PilotVoltage::VehicleConnected),
            2 => Some(PilotVoltage::ReadyToCharge),
            3 => Some(PilotVoltage::ReadyToChargeVentilated),
            4 => Some(PilotVoltage::Fault),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PilotVoltage::NoVehicle => 0,
            PilotVoltage::VehicleConnected => 1,
            PilotVoltage::ReadyToCharge => 2,
            PilotVoltage::ReadyToChargeVentilated => 3,
            PilotVoltage::Fault => 4,
        }
    }

    pub fn is_ready_to_charge(self) -> bool {
        matches!(
            self,
            PilotVoltage::ReadyToCharge | PilotVoltage::ReadyToChargeVentilated
        )
    }

    pub fn is_fault(self) -> bool {
        self == PilotVoltage::Fault
    }
}

/// Maximum current tier advertised by the station (proximity pilot / cable rating).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProximityPilotAmps {
    NoCable,
    Amp13,
    Amp20,
    Amp32,
}

impl ProximityPilotAmps {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ProximityPilotAmps::NoCable),
            1 => Some(ProximityPilotAmps::Amp13),
            2 => Some(ProximityPilotAmps::Amp20),
            3 => Some(ProximityPilotAmps::Amp32),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            ProximityPilotAmps::NoCable => 0,
            ProximityPilotAmps::Amp13 => 1,
            ProximityPilotAmps::Amp20 => 2,
            ProximityPilotAmps::Amp32 => 3,
        }
    }

    pub fn amps(self) -> u32 {
        match self {
            ProximityPilotAmps::NoCable => 0,
            ProximityPilotAmps::Amp13 => 13,
            ProximityPilotAmps::Amp20 => 20,
            ProximityPilotAmps::Amp32 => 32,
        }
    }
}

/// A single measurement with the auxiliary integer the device sends alongside it.
///
/// The tag is kept opaque; on current firmware it carries the raw ADC reading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub value: i32,
    pub tag: i32,
}

impl Sample {
    pub fn new(value: i32, tag: i32) -> Self {
        Sample { value, tag }
    }
}

/// Snapshot decoded from one inbound telemetry frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub contactor_on: bool,
    pub pwm_percent: u8,
    pub pilot_voltage: PilotVoltage,
    pub proximity_pilot: ProximityPilotAmps,
    pub phase_millivolts: [Sample; 3],
    pub phase_milliamps: [Sample; 3],
    pub wifi_rssi: i32,
    pub uptime_secs: u32,
    pub fault_flags: u32,
    pub log_messages: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl Telemetry {
    /// Highest phase current, rounded up to whole amps.
    pub fn measured_amps(&self) -> u32 {
        let milliamps = self
            .phase_milliamps
            .iter()
            .map(|sample| sample.value.max(0) as u32)
            .max()
            .unwrap_or(0);
        milliamps.div_ceil(1000)
    }

    /// Current flowing over L2 or L3 means the vehicle charges on three phases.
    pub fn uses_three_phase(&self) -> bool {
        self.phase_milliamps[1..]
            .iter()
            .any(|sample| sample.value > 2000)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum EvChargingMode {
    #[default]
    On,
    Off,
    ChargeDuringCheapHours,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoadSharingPriority {
    High,
    #[default]
    Normal,
    Low,
}

/// What the scheduler last authorised for a station.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub contactor_on: bool,
    pub amps: u32,
}

impl Authorization {
    pub const OFF: Authorization = Authorization {
        contactor_on: false,
        amps: 0,
    };
}

/// Externally visible station state, derived from pilot, mode and charging history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum StationStatus {
    /// No vehicle on the cable.
    Disconnected,
    ConnectedIdle,
    ReadyToCharge,
    #[serde(rename_all = "camelCase")]
    Charging { since: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    AtPeak {
        since: DateTime<Utc>,
        peak_amps: u32,
    },
    #[serde(rename_all = "camelCase")]
    Declining {
        since: DateTime<Utc>,
        peak_amps: u32,
        declining_since: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Stopping { since: DateTime<Utc> },
    Fault,
}
