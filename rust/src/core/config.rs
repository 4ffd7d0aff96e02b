use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::AppCore;

const DEFAULT_RECONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STATS_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(super) struct AppConfig {
    pub(super) display_name: Option<String>,
    pub(super) avatar_url: Option<String>,
    // How long a call may sit in Reconnecting before it is dropped.
    pub(super) reconnect_timeout_secs: Option<u64>,
    pub(super) stats_interval_ms: Option<u64>,
}

pub(super) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join("cove_config.json");
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    serde_json::from_slice::<AppConfig>(&bytes).unwrap_or_default()
}

impl AppCore {
    pub(super) fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.config
                .reconnect_timeout_secs
                .unwrap_or(DEFAULT_RECONNECT_TIMEOUT_SECS),
        )
    }

    pub(super) fn stats_interval_ms(&self) -> u64 {
        self.config
            .stats_interval_ms
            .unwrap_or(DEFAULT_STATS_INTERVAL_MS)
            .max(20)
    }
}
