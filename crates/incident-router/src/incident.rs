//! Incident model
//!
//! ```text
//!  PENDING ──cancel──────────► CANCELLED   (LOW)
//!     │
//!     ├──window elapsed──────► TIMED_OUT   (HIGH)
//!     │
//!     └──device confirmed────► CONFIRMED   (HIGH)
//! ```

use chrono::{DateTime, Utc};
use crash_detection::DetectionReason;
use event_fusion::MergedTelemetry;
use serde::{Deserialize, Serialize};
use storage::{Channel, ClassifiedRecord, EscalationStatus, Severity, UserResponse};

/// Incident lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Pending,
    /// The originating device's own cancel window expired
    Confirmed,
    Cancelled,
    TimedOut,
}

impl IncidentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, IncidentState::Pending)
    }

    /// Severity of an incident resolved in this state
    pub fn severity(&self) -> Severity {
        match self {
            IncidentState::Pending => Severity::None,
            IncidentState::Cancelled => Severity::Low,
            IncidentState::TimedOut | IncidentState::Confirmed => Severity::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentState::Pending => "PENDING",
            IncidentState::Confirmed => "CONFIRMED",
            IncidentState::Cancelled => "CANCELLED",
            IncidentState::TimedOut => "TIMED_OUT",
        }
    }
}

/// Classification label stored in the record's `status` field
pub fn status_label(state: IncidentState) -> &'static str {
    match state {
        IncidentState::Pending => "Awaiting user response",
        IncidentState::Cancelled => "User confirmed they are okay",
        IncidentState::TimedOut => "No response from user - Emergency!",
        IncidentState::Confirmed => "Device cancel window expired - Emergency!",
    }
}

/// One crash-candidate episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub source_id: String,
    pub state: IncidentState,
    pub merged_telemetry: MergedTelemetry,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub severity: Severity,
    /// Channel that opened the incident
    pub channel: Channel,
    pub confidence: f64,
    pub reason: DetectionReason,
    pub escalation: EscalationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_error: Option<String>,
    /// Whole seconds left in the confirmation window, while pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_secs: Option<u64>,
}

impl Incident {
    pub(crate) fn open(
        source_id: &str,
        channel: Channel,
        confidence: f64,
        reason: DetectionReason,
        merged_telemetry: MergedTelemetry,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source_id.to_string(),
            state: IncidentState::Pending,
            merged_telemetry,
            created_at: Utc::now(),
            resolved_at: None,
            severity: Severity::None,
            channel,
            confidence,
            reason,
            escalation: EscalationStatus::NotRequired,
            escalation_error: None,
            countdown_secs: None,
        }
    }

    /// Move to a terminal state and classify
    pub(crate) fn resolve(&mut self, state: IncidentState) {
        self.state = state;
        self.severity = state.severity();
        self.resolved_at = Some(Utc::now());
        self.countdown_secs = None;
    }

    pub fn user_response(&self) -> UserResponse {
        match self.state {
            IncidentState::Cancelled => UserResponse::Cancelled,
            _ => UserResponse::NoResponse,
        }
    }

    /// Persisted form of a resolved incident
    pub fn to_record(&self) -> ClassifiedRecord {
        let now = Utc::now();
        ClassifiedRecord {
            id: self.id.clone(),
            source_id: self.source_id.clone(),
            severity: self.severity,
            status: status_label(self.state).to_string(),
            g_force: self.merged_telemetry.g_force_or_zero(),
            tilt: self.merged_telemetry.tilt_or_zero(),
            location: self.merged_telemetry.location,
            detected_at: self.created_at,
            resolved_at: self.resolved_at.unwrap_or(now),
            user_response: self.user_response(),
            source: self.channel,
            confidence: self.confidence,
            escalation: self.escalation,
            escalation_error: self.escalation_error.clone(),
            logged_at: now,
        }
    }
}

/// Result of a cancel or confirm signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// The signal resolved the incident
    Resolved(Incident),
    /// No open incident, or it already resolved
    Ignored,
}

impl SignalOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, SignalOutcome::Resolved(_))
    }

    pub fn incident(&self) -> Option<&Incident> {
        match self {
            SignalOutcome::Resolved(incident) => Some(incident),
            SignalOutcome::Ignored => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crash_detection::GeoPoint;

    fn pending() -> Incident {
        Incident::open(
            "H001",
            Channel::Mobile,
            1.0,
            DetectionReason::HardImpact,
            MergedTelemetry {
                g_force: Some(10.0),
                tilt_deg: Some(10.0),
                location: Some(GeoPoint::new(15.36, 75.12)),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_severity_rule() {
        assert_eq!(IncidentState::Cancelled.severity(), Severity::Low);
        assert_eq!(IncidentState::TimedOut.severity(), Severity::High);
        assert_eq!(IncidentState::Confirmed.severity(), Severity::High);
        assert_eq!(IncidentState::Pending.severity(), Severity::None);
    }

    #[test]
    fn test_cancelled_record() {
        let mut incident = pending();
        incident.resolve(IncidentState::Cancelled);
        let record = incident.to_record();
        assert_eq!(record.severity, Severity::Low);
        assert_eq!(record.user_response, UserResponse::Cancelled);
        assert_eq!(record.status, "User confirmed they are okay");
        assert_eq!(record.g_force, 10.0);
        assert!(record.resolved_at >= record.detected_at);
    }

    #[test]
    fn test_timed_out_record() {
        let mut incident = pending();
        incident.resolve(IncidentState::TimedOut);
        let record = incident.to_record();
        assert_eq!(record.severity, Severity::High);
        assert_eq!(record.user_response, UserResponse::NoResponse);
        assert_eq!(record.status, "No response from user - Emergency!");
        assert_eq!(record.id, incident.id);
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(pending()).unwrap();
        assert_eq!(value["state"], "PENDING");
        assert_eq!(value["severity"], "NONE");
        assert_eq!(value["mergedTelemetry"]["gForce"], 10.0);
        assert!(value.get("countdownSecs").is_none());
    }
}
