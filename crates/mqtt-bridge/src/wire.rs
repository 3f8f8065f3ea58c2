//! Helmet event wire format

use chrono::Utc;
use crash_detection::sample::DEFAULT_SOURCE_ID;
use crash_detection::{GeoPoint, Vec3};
use event_fusion::PartialTelemetry;
use incident_router::RouterEvent;
use serde::{Deserialize, Serialize};
use storage::{Channel, EscalationStatus, Severity};

use crate::BridgeError;

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HelmetEventKind {
    AccidentPending,
    CrashConfirmed,
    CrashCancelled,
    #[serde(other)]
    Unknown,
}

/// One message on `helmet/+/event`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmetEvent {
    #[serde(rename = "type")]
    pub kind: HelmetEventKind,
    #[serde(default)]
    pub helmet_id: Option<String>,
    /// Originating channel, e.g. `ESP32` or `MOBILE`
    #[serde(default)]
    pub source: Option<String>,
    /// Sender clock in milliseconds (device uptime or epoch)
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub g_force: Option<f64>,
    #[serde(default)]
    pub tilt: Option<f64>,
    #[serde(default)]
    pub acceleration: Option<Vec3>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub cancel_window: Option<String>,
}

impl HelmetEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, BridgeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn source_id(&self) -> &str {
        self.helmet_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_SOURCE_ID)
    }

    pub fn channel(&self) -> Channel {
        match self
            .source
            .as_deref()
            .map(|s| s.trim().to_ascii_uppercase())
            .as_deref()
        {
            Some("ESP32") => Channel::Esp32,
            Some("MOBILE") => Channel::Mobile,
            Some("DASHBOARD") => Channel::Dashboard,
            _ => Channel::Mqtt,
        }
    }

    /// Telemetry carried by the event. Mobile fixes are authoritative.
    pub fn to_partial(&self) -> PartialTelemetry {
        PartialTelemetry {
            g_force: self.g_force,
            tilt_deg: self.tilt,
            acceleration: self.acceleration,
            location: self.location.filter(GeoPoint::is_valid),
            location_authoritative: self.channel() == Channel::Mobile,
        }
    }
}

/// Lifecycle message republished to `helmet/{id}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub helmet_id: String,
    pub incident_id: String,
    pub state: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub countdown: Option<u64>,
    pub escalation: EscalationStatus,
    pub location: Option<GeoPoint>,
    pub timestamp: i64,
}

impl StatusMessage {
    pub fn from_event(event: &RouterEvent) -> Self {
        let incident = event.incident();
        let kind = match event {
            RouterEvent::Pending(_) => "INCIDENT_PENDING",
            RouterEvent::Resolved(_) => "INCIDENT_RESOLVED",
            RouterEvent::Recorded(_) => "INCIDENT_RECORDED",
        };
        Self {
            kind: kind.to_string(),
            helmet_id: incident.source_id.clone(),
            incident_id: incident.id.clone(),
            state: incident.state.as_str().to_string(),
            severity: incident.severity,
            countdown: incident.countdown_secs,
            escalation: incident.escalation,
            location: incident.merged_telemetry.location,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
