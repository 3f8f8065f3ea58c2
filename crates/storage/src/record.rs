//! Classified record format

use chrono::{DateTime, Utc};
use crash_detection::GeoPoint;
use serde::{Deserialize, Serialize};

/// Incident severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[serde(alias = "none")]
    None,
    #[serde(alias = "low", alias = "FALSE_ALARM")]
    Low,
    #[serde(alias = "high")]
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "NONE",
            Severity::Low => "LOW",
            Severity::High => "HIGH",
        }
    }
}

/// What the rider did during the confirmation window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserResponse {
    Cancelled,
    NoResponse,
}

/// Channel the incident was first reported on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    #[default]
    Mobile,
    Esp32,
    Dashboard,
    Mqtt,
    #[serde(other)]
    Other,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Mobile => "MOBILE",
            Channel::Esp32 => "ESP32",
            Channel::Dashboard => "DASHBOARD",
            Channel::Mqtt => "MQTT",
            Channel::Other => "OTHER",
        }
    }
}

/// Outcome of the emergency notification step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    /// Severity did not call for escalation
    #[default]
    NotRequired,
    /// Dispatcher accepted the notification
    Delivered,
    /// Escalation attempted, delivery failed
    Failed,
    /// Escalation withheld by policy (no location)
    Suppressed,
    /// Dispatch in flight; only seen on live events, never persisted
    Pending,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStatus::NotRequired => "NOT_REQUIRED",
            EscalationStatus::Delivered => "DELIVERED",
            EscalationStatus::Failed => "FAILED",
            EscalationStatus::Suppressed => "SUPPRESSED",
            EscalationStatus::Pending => "PENDING",
        }
    }
}

/// One resolved incident as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedRecord {
    pub id: String,
    pub source_id: String,
    pub severity: Severity,
    /// Free-text classification label
    pub status: String,
    pub g_force: f64,
    pub tilt: f64,
    pub location: Option<GeoPoint>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub user_response: UserResponse,
    #[serde(default)]
    pub source: Channel,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub escalation: EscalationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_error: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// History filter
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub limit: usize,
    pub severity: Option<Severity>,
    pub source_id: Option<String>,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            limit: 100,
            severity: None,
            source_id: None,
        }
    }
}

impl RecordQuery {
    pub fn matches(&self, record: &ClassifiedRecord) -> bool {
        self.severity.map_or(true, |s| record.severity == s)
            && self
                .source_id
                .as_deref()
                .map_or(true, |id| record.source_id == id)
    }
}
