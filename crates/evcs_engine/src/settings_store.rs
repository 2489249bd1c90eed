use std::sync::Arc;

use evcs_core::{ConfigError, EvSettings};
use parking_lot::RwLock;

/// Current EV settings.
///
/// Readers take an immutable snapshot; replacements are validated before
/// they become visible.
pub struct SettingsStore {
    current: RwLock<Arc<EvSettings>>,
}

impl SettingsStore {
    pub fn new(settings: EvSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(SettingsStore {
            current: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn snapshot(&self) -> Arc<EvSettings> {
        self.current.read().clone()
    }

    pub fn replace(&self, settings: EvSettings) -> Result<(), ConfigError> {
        settings.validate()?;
        *self.current.write() = Arc::new(settings);
        Ok(())
    }

    /// Apply `change` to a copy of the settings and publish it if it validates.
    pub fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut EvSettings) -> Result<(), ConfigError>,
    {
        let mut current = self.current.write();
        let mut settings = EvSettings::clone(&current);
        change(&mut settings)?;
        settings.validate()?;
        *current = Arc::new(settings);
        Ok(())
    }
}
