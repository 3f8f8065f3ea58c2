//! Service settings
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then `HELMET_RELAY__SECTION__KEY` environment variables.

use alerting::AlertingConfig;
use config::{Config, Environment, File, FileFormat};
use crash_detection::ScorerConfig;
use incident_router::RouterConfig;
use mqtt_bridge::{MqttConfig, NotifyConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use storage::StorageConfig;
use thiserror::Error;

/// Path of the settings file, when set
pub const CONFIG_PATH_ENV: &str = "HELMET_RELAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/helmet-relay.toml";
const ENV_PREFIX: &str = "HELMET_RELAY";

/// Settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Allow any origin (dashboard development)
    pub cors_allow_any: bool,
    /// Simulation endpoint: seconds per replenished request
    pub simulate_per_second: u64,
    pub simulate_burst: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            cors_allow_any: true,
            simulate_per_second: 2,
            simulate_burst: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Everything the relay needs to start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub scorer: ScorerConfig,
    pub alerting: AlertingConfig,
    pub router: RouterConfig,
    pub storage: StorageConfig,
    pub mqtt: MqttConfig,
    pub notify: NotifyConfig,
}

impl RelaySettings {
    /// Load from file and environment
    pub fn load() -> Result<Self, SettingsError> {
        let explicit = std::env::var(CONFIG_PATH_ENV).ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let settings: Self = Config::builder()
            .add_source(
                File::from(Path::new(&path))
                    .format(FileFormat::Toml)
                    .required(explicit.is_some()),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load from a TOML document over the defaults
    pub fn from_toml(toml: &str) -> Result<Self, SettingsError> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.scorer.validate().map_err(|e| SettingsError::Invalid(e.to_string()))?;
        self.alerting.validate().map_err(|e| SettingsError::Invalid(e.to_string()))?;
        self.router.validate().map_err(|e| SettingsError::Invalid(e.to_string()))?;
        if self.mqtt.enabled {
            self.mqtt.validate().map_err(|e| SettingsError::Invalid(e.to_string()))?;
        }
        if self.storage.max_records == 0 {
            return Err(SettingsError::Invalid(
                "storage.max_records must be positive".to_string(),
            ));
        }
        if self.server.simulate_per_second == 0 || self.server.simulate_burst == 0 {
            return Err(SettingsError::Invalid(
                "server simulate rate limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_bridge::NotifyChannel;
    use std::time::Duration;
    use storage::StorageBackend;

    #[test]
    fn test_defaults() {
        let settings = RelaySettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scorer.g_crash, 6.5);
        assert_eq!(settings.alerting.cooldown(), Duration::from_secs(30));
        assert_eq!(settings.alerting.confirmation_window(), Duration::from_secs(10));
        assert_eq!(settings.server.bind, "0.0.0.0:8080");
        assert_eq!(settings.notify.channel, NotifyChannel::None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = RelaySettings::from_toml(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [alerting]
            confirmation_window_ms = 15000

            [storage]
            backend = "sqlite"

            [notify]
            channel = "webhook"
            webhook_url = "http://localhost:9000/hook"
            "#,
        )
        .unwrap();

        assert_eq!(settings.server.bind, "127.0.0.1:9000");
        assert!(settings.server.cors_allow_any);
        assert_eq!(settings.alerting.confirmation_window(), Duration::from_secs(15));
        assert_eq!(settings.alerting.cooldown_seconds, 30);
        assert_eq!(settings.storage.backend, StorageBackend::Sqlite);
        assert_eq!(settings.notify.channel, NotifyChannel::Webhook);
        assert_eq!(settings.scorer.trigger_confidence, 0.7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = RelaySettings::from_toml(
            r#"
            [scorer]
            trigger_confidence = 1.5
            "#,
        );
        assert!(matches!(result, Err(SettingsError::Invalid(_))));

        let result = RelaySettings::from_toml(
            r#"
            [alerting]
            confirmation_window_ms = 0
            "#,
        );
        assert!(matches!(result, Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn test_disabled_mqtt_is_not_validated() {
        let settings = RelaySettings::from_toml(
            r#"
            [mqtt]
            enabled = false
            host = ""
            "#,
        )
        .unwrap();
        assert!(!settings.mqtt.enabled);
    }
}
