//! Control pilot duty cycle encoding.
//!
//! The station expresses the maximum current a vehicle may draw as a PWM duty
//! cycle: `duty% = amps / 0.6` inside the 6A..51A band. A duty of 100% (a
//! constant high signal) means no current is authorised.
//!
//! ```text
//! 10% =>  6A
//! 15% =>  9A
//! 27% => 16A
//! 54% => 32A
//! ```

use crate::ProximityPilotAmps;

/// Duty value meaning "no current authorised".
pub const PWM_NO_CURRENT: u8 = 100;

/// Duty cycle for a requested current, bounded by the station's advertised tier.
///
/// Rounds up so that `duty_to_amps` recovers the requested value exactly.
pub fn amps_to_duty(amps: u32, tier: ProximityPilotAmps) -> u8 {
    let amps = amps.min(tier.amps());
    if amps == 0 {
        return PWM_NO_CURRENT;
    }
    // ceil(amps * 10 / 6); tiers top out at 32A so this stays far below 100
    ((amps * 10 + 5) / 6) as u8
}

/// Current limit encoded by a duty cycle value.
pub fn duty_to_amps(duty: u8) -> u32 {
    if duty >= PWM_NO_CURRENT {
        0
    } else {
        u32::from(duty) * 6 / 10
    }
}
