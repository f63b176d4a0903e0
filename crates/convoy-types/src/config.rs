//! Environment-driven engine configuration.
//!
//! Convoy is configured entirely through `CONVOY_*` environment variables;
//! there is no config file. Transports read `host`/`port`, the engine reads
//! the rest.

use std::path::PathBuf;

use crate::error::{ConvoyError, Result};

pub const ENV_DATA_DIR: &str = "CONVOY_DATA_DIR";
pub const ENV_HOST: &str = "CONVOY_HOST";
pub const ENV_PORT: &str = "CONVOY_PORT";
pub const ENV_LOG: &str = "CONVOY_LOG";
pub const ENV_AGENT_BIN: &str = "CONVOY_AGENT_BIN";

/// Engine configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct ConvoyConfig {
    /// Root of all persisted state (items, event logs, workspaces).
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Log filter directive (`info`, `convoy_daemon=debug`, ...).
    pub log: String,
    /// Explicit path to the AI-assistant binary, overriding discovery.
    pub agent_bin: Option<PathBuf>,
}

impl Default for ConvoyConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".convoy"),
            host: "127.0.0.1".into(),
            port: 4100,
            log: "info".into(),
            agent_bin: None,
        }
    }
}

impl ConvoyConfig {
    /// Build the configuration from `CONVOY_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if dir.is_empty() {
                return Err(ConvoyError::Config(format!("{ENV_DATA_DIR} is empty")));
            }
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(host) = std::env::var(ENV_HOST) {
            config.host = host;
        }
        if let Ok(port) = std::env::var(ENV_PORT) {
            config.port = port
                .parse()
                .map_err(|_| ConvoyError::Config(format!("{ENV_PORT}='{port}' is not a port")))?;
        }
        if let Ok(log) = std::env::var(ENV_LOG) {
            config.log = log;
        }
        if let Ok(bin) = std::env::var(ENV_AGENT_BIN) {
            if !bin.is_empty() {
                config.agent_bin = Some(PathBuf::from(bin));
            }
        }

        Ok(config)
    }
}
