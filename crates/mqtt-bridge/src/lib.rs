//! MQTT Bridge
//!
//! Broker side of the relay:
//! - decodes helmet events from `helmet/+/event` and feeds the router
//! - republishes incident lifecycle to `helmet/{id}/status`
//! - delivers escalations over MQTT, a webhook or SMTP email

mod bridge;
mod config;
mod dispatch;
mod email;
mod wire;

pub use bridge::{apply_event, Applied, MqttBridge};
pub use config::{EmailConfig, MqttConfig, NotifyChannel, NotifyConfig};
pub use email::EmailDispatcher;
pub use dispatch::{build_dispatcher, MqttDispatcher, UnconfiguredDispatcher, WebhookDispatcher};
pub use wire::{HelmetEvent, HelmetEventKind, StatusMessage};

use thiserror::Error;

/// Bridge error types
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Invalid bridge configuration: {0}")]
    Config(String),

    #[error("Malformed event payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}
