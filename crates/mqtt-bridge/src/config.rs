//! Broker and notification configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::BridgeError;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Connect to the broker at all
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Subscription filter for helmet events
    pub event_topic: String,
    /// Lifecycle republish topic; `{id}` is the source id
    pub status_topic: String,
    /// Escalation topic; `{id}` is the source id
    pub alert_topic: String,
    pub keep_alive_secs: u64,
    /// Back-off after a connection error
    pub reconnect_delay_secs: u64,
    /// Request channel capacity of the client
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "helmet-relay".to_string(),
            event_topic: "helmet/+/event".to_string(),
            status_topic: "helmet/{id}/status".to_string(),
            alert_topic: "helmet/{id}/alert".to_string(),
            keep_alive_secs: 30,
            reconnect_delay_secs: 5,
            channel_capacity: 10,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn status_topic_for(&self, source_id: &str) -> String {
        self.status_topic.replace("{id}", source_id)
    }

    pub fn alert_topic_for(&self, source_id: &str) -> String {
        self.alert_topic.replace("{id}", source_id)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::Config("mqtt.host is empty".to_string()));
        }
        if self.event_topic.trim().is_empty() {
            return Err(BridgeError::Config("mqtt.event_topic is empty".to_string()));
        }
        for (name, template) in [("status_topic", &self.status_topic), ("alert_topic", &self.alert_topic)] {
            if !template.contains("{id}") {
                return Err(BridgeError::Config(format!(
                    "mqtt.{} must contain {{id}}",
                    name
                )));
            }
        }
        if self.channel_capacity == 0 {
            return Err(BridgeError::Config(
                "mqtt.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Escalation delivery channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    #[default]
    None,
    Mqtt,
    Webhook,
    Email,
}

/// SMTP settings for the email channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub smtp_host: String,
    /// Implicit TLS port
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    /// Emergency contacts
    pub to: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 465,
            username: None,
            password: None,
            from: "Smart Helmet System <noreply@smarthelmet.com>".to_string(),
            to: Vec::new(),
            timeout_secs: 10,
        }
    }
}

impl EmailConfig {
    /// Username and password, when both are set and non-empty
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref().filter(|v| !v.trim().is_empty())?;
        let password = self.password.as_deref().filter(|v| !v.is_empty())?;
        Some((username, password))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Escalation delivery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub channel: NotifyChannel,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
    pub email: EmailConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: NotifyChannel::None,
            webhook_url: None,
            webhook_timeout_secs: 10,
            email: EmailConfig::default(),
        }
    }
}

impl NotifyConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}
