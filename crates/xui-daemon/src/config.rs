//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use xui_engine::{EngineSettings, MaintenanceIntervals};

/// Default location of the daemon config
pub const DEFAULT_CONFIG_PATH: &str = "/etc/x-ui/daemon.json";

/// Daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Xray binary, config output and stats API location
    pub engine: EngineSettings,
    /// Inbound database (JSON array of inbound records)
    pub inbound_db: PathBuf,
    /// Engine config template; the built-in one is used when unset
    pub template_path: Option<PathBuf>,
    pub restart_check_secs: u64,
    pub crash_check_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let intervals = MaintenanceIntervals::default();
        Self {
            engine: EngineSettings::default(),
            inbound_db: PathBuf::from("/etc/x-ui/inbounds.json"),
            template_path: None,
            restart_check_secs: intervals.restart_check.as_secs(),
            crash_check_secs: intervals.crash_check.as_secs(),
        }
    }
}

impl DaemonConfig {
    /// Load from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Maintenance tick periods; zero falls back to one second
    pub fn intervals(&self) -> MaintenanceIntervals {
        MaintenanceIntervals {
            restart_check: Duration::from_secs(self.restart_check_secs.max(1)),
            crash_check: Duration::from_secs(self.crash_check_secs.max(1)),
        }
    }
}
