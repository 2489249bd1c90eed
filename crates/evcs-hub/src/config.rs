use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use evcs_core::EvSettings;
use evcs_link::LinkSettings;
use serde::{Deserialize, Serialize};

/// Hub configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HubConfig {
    /// TCP port the stations connect to
    pub station_port: u16,
    /// HTTP API port
    pub api_port: u16,
    pub heartbeat_interval_ms: u64,
    pub response_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Bytes of firmware per upload chunk
    pub firmware_chunk_size: usize,
    /// Initial answer of the price signal until it is set through the API
    pub price_acceptable: bool,
    pub ev: EvSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            station_port: 9091,
            api_port: 3000,
            heartbeat_interval_ms: 5_000,
            response_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
            firmware_chunk_size: 4096,
            price_acceptable: false,
            ev: EvSettings::default(),
        }
    }
}

impl HubConfig {
    pub async fn load(path: &Path) -> anyhow::Result<HubConfig> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config: HubConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        config
            .ev
            .validate()
            .with_context(|| format!("Invalid EV settings in '{}'", path.display()))?;
        Ok(config)
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            firmware_chunk_size: self.firmware_chunk_size,
        }
    }
}
