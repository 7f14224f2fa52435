//! Agent configuration

use anyhow::{Context, Result};
use sdk_core::Settings;
use serde::Deserialize;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "FLAGSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON flag map served in localhost mode
    #[serde(default)]
    pub localhost_file: Option<String>,

    #[serde(default)]
    pub settings: Settings,
}

fn default_api_port() -> u16 {
    8080
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            localhost_file: None,
            settings: Settings::default(),
        }
    }
}

impl AgentConfig {
    /// Load from the optional config file, then `FLAGSYNC__*` variables
    /// (e.g. `FLAGSYNC__SETTINGS__CORE__AUTHORIZATION_KEY`)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("FLAGSYNC").separator("__"))
            .build()
            .context("Failed to read configuration")?;

        let mut agent: Self = config
            .try_deserialize()
            .context("Invalid configuration")?;
        if agent.settings.sdk_version.is_empty() {
            agent.settings.sdk_version = format!("flagsync-agent-{}", env!("CARGO_PKG_VERSION"));
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_source() {
        let config = config::Config::builder().build().unwrap();
        let agent: AgentConfig = config.try_deserialize().unwrap();
        assert_eq!(agent.api_port, 8080);
        assert!(agent.localhost_file.is_none());
        assert!(agent.settings.sync.streaming_enabled);
    }

    #[test]
    fn test_nested_settings_from_source() {
        let config = config::Config::builder()
            .set_override("api_port", 9000)
            .unwrap()
            .set_override("settings.core.key", "emma")
            .unwrap()
            .set_override("settings.scheduler.events_queue_size", 10)
            .unwrap()
            .build()
            .unwrap();
        let agent: AgentConfig = config.try_deserialize().unwrap();
        assert_eq!(agent.api_port, 9000);
        assert_eq!(agent.settings.core.key.as_deref(), Some("emma"));
        assert_eq!(agent.settings.scheduler.events_queue_size, 10);
    }
}
