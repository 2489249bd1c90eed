//! Domain model and pure control logic for EV charging stations sharing
//! power connections.

pub mod allocator;
pub mod charging;
pub mod codec;
mod models;
pub mod scheduler;
pub mod settings;

pub use crate::models::*;
pub use crate::settings::{ChargerSettings, ConfigError, EvSettings, PowerConnectionSettings};
