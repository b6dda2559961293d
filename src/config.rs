// Daemon configuration loaded from YAML

use crate::jobs::{self, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REMINDER_CRON, MIN_POLL_INTERVAL_MS};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the SQLite database and the daemon lock
    pub store_path: PathBuf,

    /// Address the HTTP API binds to
    pub listen: String,

    /// Base URL of the messaging gateway
    pub gateway_url: String,

    pub gateway_timeout_secs: u64,

    /// Milliseconds between overdue poller ticks
    pub poll_interval_ms: u64,

    /// Six-field cron expression for the daily reminder
    pub reminder_cron: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            listen: "127.0.0.1:8080".to_string(),
            gateway_url: "http://localhost:8081".to_string(),
            gateway_timeout_secs: 10,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            reminder_cron: DEFAULT_REMINDER_CRON.to_string(),
        }
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("ticketstore"))
        .unwrap_or_else(|| PathBuf::from(".ticketstore"))
}

/// Default config file location (~/.config/ticketstore/config.yaml)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ticketstore").join("config.yaml"))
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => {
                    debug!("No config file, using defaults");
                    Config::default()
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!(path = ?path, "Loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(eyre!(
                "poll_interval_ms must be at least {}, got {}",
                MIN_POLL_INTERVAL_MS,
                self.poll_interval_ms
            ));
        }
        jobs::parse_cron(&self.reminder_cron).map_err(|e| eyre!("reminder_cron: {}", e))?;
        self.listen_addr()?;
        if self.gateway_timeout_secs == 0 {
            return Err(eyre!("gateway_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address {:?}", self.listen))
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }
}
