//! Target currents and commands for every station on one power connection.
//!
//! Planning is a pure function of the stations' latest reports, their
//! charging history and one settings snapshot. The caller owns locking and
//! command delivery.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::allocator::{self, AllocationRequest, AllocationStrategy, PriorityLoadSharing};
use crate::charging::ChargingDerivedState;
use crate::codec::{PWM_NO_CURRENT, amps_to_duty, duty_to_amps};
use crate::settings::EvSettings;
use crate::{Authorization, LoadSharingPriority, PilotVoltage, ProximityPilotAmps, Telemetry};

/// Per power connection parameters of one planning pass.
#[derive(Clone, Copy)]
pub struct CircuitLimits {
    pub capacity: u32,
    pub lowest_charge_rate: u32,
    pub amp_delta: u32,
    pub stay_in_charging_ms: u64,
    pub stay_in_stopping_ms: u64,
    pub strategy: &'static dyn AllocationStrategy,
}

impl CircuitLimits {
    pub fn for_circuit(settings: &EvSettings, power_connection_id: &str) -> Self {
        CircuitLimits {
            capacity: settings.available_capacity(power_connection_id),
            lowest_charge_rate: settings.lowest_charge_rate,
            amp_delta: settings.charging_ending_amp_delta,
            stay_in_charging_ms: settings.stay_in_charging_for_ms,
            stay_in_stopping_ms: settings.stay_in_stopping_charging_for_ms,
            strategy: allocator::strategy_by_id(settings.load_sharing_algorithm(power_connection_id))
                .unwrap_or(&PriorityLoadSharing),
        }
    }
}

/// The part of the latest telemetry the planner looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedState {
    pub contactor_on: bool,
    pub pwm_percent: u8,
    pub pilot_voltage: PilotVoltage,
    pub proximity_pilot: ProximityPilotAmps,
    pub measured_amps: u32,
}

impl From<&Telemetry> for ReportedState {
    fn from(telemetry: &Telemetry) -> Self {
        ReportedState {
            contactor_on: telemetry.contactor_on,
            pwm_percent: telemetry.pwm_percent,
            pilot_voltage: telemetry.pilot_voltage,
            proximity_pilot: telemetry.proximity_pilot,
            measured_amps: telemetry.measured_amps(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StationInput {
    pub client_id: String,
    pub priority: LoadSharingPriority,
    pub charge_rate_limit: u32,
    /// Mode and price currently allow charging.
    pub permitted: bool,
    pub reported: ReportedState,
    pub derived: ChargingDerivedState,
    pub authorized: Authorization,
    pub stopping_since: Option<DateTime<Utc>>,
}

impl StationInput {
    fn max_amps(&self) -> u32 {
        self.reported.proximity_pilot.amps().min(self.charge_rate_limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationTarget {
    pub authorization: Authorization,
    pub pwm_percent: u8,
    pub stopping_since: Option<DateTime<Utc>>,
}

impl StationTarget {
    pub const OFF: StationTarget = StationTarget {
        authorization: Authorization::OFF,
        pwm_percent: PWM_NO_CURRENT,
        stopping_since: None,
    };

    fn charging(amps: u32, tier: ProximityPilotAmps) -> Self {
        if amps == 0 {
            return StationTarget::OFF;
        }
        StationTarget {
            authorization: Authorization {
                contactor_on: true,
                amps,
            },
            pwm_percent: amps_to_duty(amps, tier),
            stopping_since: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandKind {
    SetPwmPercent(u8),
    SetContactorState(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationCommand {
    pub client_id: String,
    pub kind: CommandKind,
    /// Lowers the current the station may draw.
    pub decrement: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircuitPlan {
    pub targets: BTreeMap<String, StationTarget>,
    /// Decrements first, each group ordered by client id.
    pub commands: Vec<StationCommand>,
}

impl CircuitPlan {
    pub fn authorized_total(&self) -> u32 {
        self.targets
            .values()
            .map(|target| target.authorization.amps)
            .sum()
    }
}

pub fn plan_circuit(
    limits: &CircuitLimits,
    stations: &[StationInput],
    now: DateTime<Utc>,
) -> CircuitPlan {
    let mut stations: Vec<&StationInput> = stations.iter().collect();
    stations.sort_by(|a, b| a.client_id.cmp(&b.client_id));

    let mut targets = BTreeMap::new();
    let mut spare = Vec::new();
    let mut others = Vec::new();

    for station in &stations {
        let pilot = station.reported.pilot_voltage;
        if pilot.is_fault() || !pilot.is_ready_to_charge() {
            targets.insert(station.client_id.clone(), StationTarget::OFF);
        } else if !station.permitted {
            targets.insert(station.client_id.clone(), stopping_target(limits, station, now));
        } else if station
            .derived
            .has_spare_capacity(now, limits.stay_in_charging_ms)
        {
            spare.push(*station);
        } else {
            others.push(*station);
        }
    }

    // Stations giving capacity back keep what they draw plus the noise band
    let mut used = 0;
    for station in spare {
        let max_amps = station.max_amps();
        let left = limits.capacity - used;
        let wanted = (station.reported.measured_amps + limits.amp_delta)
            .min(max_amps)
            .min(left);
        let amps = if wanted >= limits.lowest_charge_rate {
            wanted
        } else if max_amps >= limits.lowest_charge_rate && left >= limits.lowest_charge_rate {
            limits.lowest_charge_rate
        } else {
            0
        };
        used += amps;
        targets.insert(
            station.client_id.clone(),
            StationTarget::charging(amps, station.reported.proximity_pilot),
        );
    }

    let requests: Vec<AllocationRequest> = others
        .iter()
        .map(|station| {
            AllocationRequest::new(station.client_id.clone(), station.priority, station.max_amps())
        })
        .collect();
    let allocation =
        limits
            .strategy
            .allocate(limits.capacity - used, limits.lowest_charge_rate, &requests);
    for station in others {
        let amps = allocation.get(&station.client_id).copied().unwrap_or(0);
        targets.insert(
            station.client_id.clone(),
            StationTarget::charging(amps, station.reported.proximity_pilot),
        );
    }

    let mut decrements = Vec::new();
    let mut increments = Vec::new();
    for station in &stations {
        let Some(target) = targets.get(&station.client_id) else {
            continue;
        };
        let (decrement, kinds) = station_commands(station, target);
        let commands = kinds.into_iter().map(|kind| StationCommand {
            client_id: station.client_id.clone(),
            kind,
            decrement,
        });
        if decrement {
            decrements.extend(commands);
        } else {
            increments.extend(commands);
        }
    }
    decrements.extend(increments);

    CircuitPlan {
        targets,
        commands: decrements,
    }
}

/// PWM goes to "no current" at once; the contactor follows after the grace period.
fn stopping_target(limits: &CircuitLimits, station: &StationInput, now: DateTime<Utc>) -> StationTarget {
    if !station.reported.contactor_on {
        return StationTarget::OFF;
    }
    let since = station.stopping_since.unwrap_or(now);
    if now - since >= TimeDelta::milliseconds(limits.stay_in_stopping_ms as i64) {
        return StationTarget::OFF;
    }
    StationTarget {
        authorization: Authorization {
            contactor_on: true,
            amps: 0,
        },
        pwm_percent: PWM_NO_CURRENT,
        stopping_since: Some(since),
    }
}

/// Commands bringing the device from its reported state to the target.
///
/// Lowering the current sends PWM before the contactor, raising it closes the
/// contactor before the PWM signal goes up.
fn station_commands(station: &StationInput, target: &StationTarget) -> (bool, Vec<CommandKind>) {
    let reported = &station.reported;
    let previous_amps = station
        .authorized
        .amps
        .max(duty_to_amps(reported.pwm_percent));
    let decrement = target.authorization.amps < previous_amps
        || (reported.contactor_on && !target.authorization.contactor_on);

    let pwm = (reported.pwm_percent != target.pwm_percent)
        .then_some(CommandKind::SetPwmPercent(target.pwm_percent));
    let contactor = (reported.contactor_on != target.authorization.contactor_on)
        .then_some(CommandKind::SetContactorState(target.authorization.contactor_on));

    let ordered = if decrement {
        [pwm, contactor]
    } else {
        [contactor, pwm]
    };
    (decrement, ordered.into_iter().flatten().collect())
}
