//! Per-station charging history derived from consecutive telemetry frames.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{PilotVoltage, StationStatus, Telemetry};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSession {
    pub started_at: DateTime<Utc>,
    pub peak_amps: u32,
    pub peak_at: DateTime<Utc>,
    /// Set once the draw fell more than the amp delta below the peak.
    pub declining_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", content = "session", rename_all = "camelCase")]
pub enum ChargingDerivedState {
    #[default]
    NotCharging,
    Charging(ChargingSession),
}

/// Inputs for one transition of the derived state.
#[derive(Debug, Clone, Copy)]
pub struct ChargingObservation {
    pub ready_to_charge: bool,
    pub permitted: bool,
    pub measured_amps: u32,
    /// Current the scheduler has authorised; caps the recorded peak.
    pub authorized_amps: u32,
    pub amp_delta: u32,
    pub now: DateTime<Utc>,
}

impl ChargingDerivedState {
    pub fn session(&self) -> Option<&ChargingSession> {
        match self {
            ChargingDerivedState::NotCharging => None,
            ChargingDerivedState::Charging(session) => Some(session),
        }
    }

    pub fn is_charging(&self) -> bool {
        matches!(self, ChargingDerivedState::Charging(_))
    }

    /// Advance the state with a new observation.
    pub fn observe(self, observation: ChargingObservation) -> ChargingDerivedState {
        let ChargingObservation {
            ready_to_charge,
            permitted,
            measured_amps,
            authorized_amps,
            amp_delta,
            now,
        } = observation;

        if !ready_to_charge || !permitted {
            return ChargingDerivedState::NotCharging;
        }

        let mut session = match self {
            ChargingDerivedState::NotCharging => {
                return ChargingDerivedState::Charging(ChargingSession {
                    started_at: now,
                    peak_amps: measured_amps,
                    peak_at: now,
                    declining_since: None,
                });
            }
            ChargingDerivedState::Charging(session) => session,
        };

        // a lower authorisation is not the vehicle giving back capacity,
        // unless the vehicle already started giving it back
        let declining = session.declining_since.is_some();
        if !declining && authorized_amps > 0 && session.peak_amps > authorized_amps {
            session.peak_amps = authorized_amps;
            session.peak_at = now;
        }

        if measured_amps > session.peak_amps {
            session.peak_amps = measured_amps;
            session.peak_at = now;
            session.declining_since = None;
        } else if session.peak_amps - measured_amps > amp_delta {
            session.declining_since.get_or_insert(now);
        } else if !declining {
            // within the noise band: follow the reading down
            session.peak_amps = measured_amps;
        }

        ChargingDerivedState::Charging(session)
    }

    /// The decline has lasted longer than the grace window.
    pub fn has_spare_capacity(&self, now: DateTime<Utc>, grace_ms: u64) -> bool {
        self.session()
            .and_then(|session| session.declining_since)
            .is_some_and(|since| now - since > TimeDelta::milliseconds(grace_ms as i64))
    }
}

/// Externally visible status of a station.
pub fn station_status(
    telemetry: Option<&Telemetry>,
    derived: &ChargingDerivedState,
    stopping_since: Option<DateTime<Utc>>,
) -> StationStatus {
    let Some(telemetry) = telemetry else {
        return StationStatus::Disconnected;
    };
    if telemetry.pilot_voltage.is_fault() {
        return StationStatus::Fault;
    }
    if let Some(since) = stopping_since {
        return StationStatus::Stopping { since };
    }
    match telemetry.pilot_voltage {
        PilotVoltage::NoVehicle | PilotVoltage::Fault => StationStatus::Disconnected,
        PilotVoltage::VehicleConnected => StationStatus::ConnectedIdle,
        PilotVoltage::ReadyToCharge | PilotVoltage::ReadyToChargeVentilated => {
            match derived.session() {
                Some(session) if telemetry.contactor_on => {
                    let measured_amps = telemetry.measured_amps();
                    if let Some(declining_since) = session.declining_since {
                        StationStatus::Declining {
                            since: session.started_at,
                            peak_amps: session.peak_amps,
                            declining_since,
                        }
                    } else if measured_amps > 0 && measured_amps >= session.peak_amps {
                        StationStatus::AtPeak {
                            since: session.started_at,
                            peak_amps: session.peak_amps,
                        }
                    } else {
                        StationStatus::Charging {
                            since: session.started_at,
                        }
                    }
                }
                _ => StationStatus::ReadyToCharge,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProximityPilotAmps, Sample};

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    fn observe(state: ChargingDerivedState, measured_amps: u32, seconds: i64) -> ChargingDerivedState {
        state.observe(ChargingObservation {
            ready_to_charge: true,
            permitted: true,
            measured_amps,
            authorized_amps: 32,
            amp_delta: 2,
            now: at(seconds),
        })
    }

    #[test]
    fn test_session_starts_at_current_draw() {
        let state = observe(ChargingDerivedState::NotCharging, 4, 0);
        let session = state.session().unwrap();
        assert_eq!(session.started_at, at(0));
        assert_eq!(session.peak_amps, 4);
        assert_eq!(session.declining_since, None);
    }

    #[test]
    fn test_peak_follows_increasing_draw() {
        let mut state = observe(ChargingDerivedState::NotCharging, 0, 0);
        state = observe(state, 10, 5);
        state = observe(state, 16, 10);
        let session = state.session().unwrap();
        assert_eq!(session.peak_amps, 16);
        assert_eq!(session.peak_at, at(10));
        assert_eq!(session.started_at, at(0));
    }

    #[test]
    fn test_small_dip_is_noise() {
        let mut state = observe(ChargingDerivedState::NotCharging, 16, 0);
        state = observe(state, 15, 5);
        let session = state.session().unwrap();
        assert_eq!(session.peak_amps, 15);
        assert_eq!(session.declining_since, None);
    }

    #[test]
    fn test_decline_marked_once() {
        let mut state = observe(ChargingDerivedState::NotCharging, 16, 0);
        state = observe(state, 10, 5);
        state = observe(state, 9, 10);
        let session = state.session().unwrap();
        assert_eq!(session.peak_amps, 16);
        assert_eq!(session.declining_since, Some(at(5)));

        assert!(!state.has_spare_capacity(at(30), 30_000));
        assert!(state.has_spare_capacity(at(36), 30_000));
    }

    #[test]
    fn test_rising_draw_clears_decline() {
        let mut state = observe(ChargingDerivedState::NotCharging, 16, 0);
        state = observe(state, 10, 5);
        state = observe(state, 17, 10);
        let session = state.session().unwrap();
        assert_eq!(session.peak_amps, 17);
        assert_eq!(session.declining_since, None);
    }

    #[test]
    fn test_leaving_ready_clears_session() {
        let state = observe(ChargingDerivedState::NotCharging, 16, 0);
        let state = state.observe(ChargingObservation {
            ready_to_charge: false,
            permitted: true,
            measured_amps: 0,
            authorized_amps: 0,
            amp_delta: 2,
            now: at(5),
        });
        assert_eq!(state, ChargingDerivedState::NotCharging);

        // a new session starts from scratch
        let state = observe(state, 3, 10);
        assert_eq!(state.session().unwrap().peak_amps, 3);
        assert_eq!(state.session().unwrap().started_at, at(10));
    }

    #[test]
    fn test_mode_revoked_clears_session() {
        let state = observe(ChargingDerivedState::NotCharging, 16, 0);
        let state = state.observe(ChargingObservation {
            ready_to_charge: true,
            permitted: false,
            measured_amps: 16,
            authorized_amps: 16,
            amp_delta: 2,
            now: at(5),
        });
        assert!(!state.is_charging());
    }

    #[test]
    fn test_reduced_authorisation_is_not_a_decline() {
        let state = observe(ChargingDerivedState::NotCharging, 32, 0);
        let state = state.observe(ChargingObservation {
            ready_to_charge: true,
            permitted: true,
            measured_amps: 16,
            authorized_amps: 16,
            amp_delta: 2,
            now: at(5),
        });
        let session = state.session().unwrap();
        assert_eq!(session.peak_amps, 16);
        assert_eq!(session.declining_since, None);
    }

    #[test]
    fn test_decline_survives_reallocation() {
        let mut state = observe(ChargingDerivedState::NotCharging, 16, 0);
        state = observe(state, 10, 5);

        // capacity handed back: authorised down to the draw plus the delta
        for (measured_amps, seconds) in [(10, 40), (11, 45), (12, 50)] {
            state = state.observe(ChargingObservation {
                ready_to_charge: true,
                permitted: true,
                measured_amps,
                authorized_amps: 12,
                amp_delta: 2,
                now: at(seconds),
            });
            let session = state.session().unwrap();
            assert_eq!(session.peak_amps, 16);
            assert_eq!(session.declining_since, Some(at(5)));
            assert!(state.has_spare_capacity(at(seconds), 30_000));
        }
    }

    #[test]
    fn test_decline_ends_above_peak() {
        let mut state = observe(ChargingDerivedState::NotCharging, 16, 0);
        state = observe(state, 10, 5);
        state = observe(state, 15, 10);
        assert_eq!(state.session().unwrap().declining_since, Some(at(5)));

        state = observe(state, 17, 15);
        let session = state.session().unwrap();
        assert_eq!(session.peak_amps, 17);
        assert_eq!(session.declining_since, None);
    }

    fn telemetry(pilot_voltage: PilotVoltage, contactor_on: bool, milliamps: i32) -> Telemetry {
        Telemetry {
            contactor_on,
            pwm_percent: 54,
            pilot_voltage,
            proximity_pilot: ProximityPilotAmps::Amp32,
            phase_millivolts: [Sample::new(230_000, 0); 3],
            phase_milliamps: [Sample::new(milliamps, 0), Sample::default(), Sample::default()],
            wifi_rssi: -70,
            uptime_secs: 100,
            fault_flags: 0,
            log_messages: vec![],
            received_at: at(0),
        }
    }

    #[test]
    fn test_status_follows_pilot() {
        let none = ChargingDerivedState::NotCharging;
        assert_eq!(station_status(None, &none, None), StationStatus::Disconnected);
        assert_eq!(
            station_status(Some(&telemetry(PilotVoltage::NoVehicle, false, 0)), &none, None),
            StationStatus::Disconnected
        );
        assert_eq!(
            station_status(Some(&telemetry(PilotVoltage::VehicleConnected, false, 0)), &none, None),
            StationStatus::ConnectedIdle
        );
        assert_eq!(
            station_status(Some(&telemetry(PilotVoltage::ReadyToCharge, false, 0)), &none, None),
            StationStatus::ReadyToCharge
        );
        assert_eq!(
            station_status(Some(&telemetry(PilotVoltage::Fault, true, 0)), &none, Some(at(0))),
            StationStatus::Fault
        );
    }

    #[test]
    fn test_status_while_charging() {
        let state = observe(ChargingDerivedState::NotCharging, 16, 0);
        assert_eq!(
            station_status(Some(&telemetry(PilotVoltage::ReadyToCharge, true, 16_000)), &state, None),
            StationStatus::AtPeak {
                since: at(0),
                peak_amps: 16
            }
        );

        let state = observe(state, 10, 5);
        assert_eq!(
            station_status(Some(&telemetry(PilotVoltage::ReadyToCharge, true, 10_000)), &state, None),
            StationStatus::Declining {
                since: at(0),
                peak_amps: 16,
                declining_since: at(5)
            }
        );

        assert_eq!(
            station_status(
                Some(&telemetry(PilotVoltage::ReadyToCharge, true, 10_000)),
                &state,
                Some(at(6))
            ),
            StationStatus::Stopping { since: at(6) }
        );
    }
}
