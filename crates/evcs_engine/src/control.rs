use std::collections::HashMap;
use std::sync::Arc;

use evcs_core::scheduler::{CommandKind, StationCommand};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::registry::StationRegistry;

/// One lock per power connection so independent circuits plan concurrently.
#[derive(Default)]
pub(crate) struct CircuitLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CircuitLocks {
    pub(crate) fn lock_for(&self, power_connection_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(power_connection_id.to_string())
            .or_default()
            .clone()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    pub failed: usize,
    /// Increments held back because a decrement did not go through.
    pub skipped: usize,
}

/// Deliver planned commands in order.
///
/// Once a decrement fails the circuit may still carry the old current on that
/// station, so no increment is sent in this pass.
pub(crate) async fn dispatch(
    registry: &StationRegistry,
    commands: Vec<StationCommand>,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    let mut decrement_failed = false;

    for command in commands {
        if decrement_failed && !command.decrement {
            debug!(client_id = %command.client_id, kind = ?command.kind, "Skipping increment");
            report.skipped += 1;
            continue;
        }
        let Some(handle) = registry.handle(&command.client_id) else {
            debug!(client_id = %command.client_id, "Station left before its command was sent");
            report.failed += 1;
            decrement_failed |= command.decrement;
            continue;
        };

        let delivered = match command.kind {
            CommandKind::SetPwmPercent(duty) => handle.set_pwm_percent(duty).await,
            CommandKind::SetContactorState(on) => handle.set_contactor_state(on).await,
        };
        if delivered {
            debug!(client_id = %command.client_id, kind = ?command.kind, "Command delivered");
            report.sent += 1;
        } else {
            warn!(client_id = %command.client_id, kind = ?command.kind, "Command delivery failed");
            report.failed += 1;
            decrement_failed |= command.decrement;
        }
    }
    report
}
