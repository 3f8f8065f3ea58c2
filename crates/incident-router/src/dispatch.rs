//! Notification dispatch seam
//!
//! The router hands HIGH incidents to a [`NotificationDispatcher`] exactly
//! once. Delivery, retries and transport belong to the implementation.

use chrono::{DateTime, Utc};
use crash_detection::GeoPoint;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use storage::Channel;
use thiserror::Error;

use crate::incident::{status_label, Incident};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Dispatch errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("No delivery channel configured")]
    NotConfigured,
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Delivery timed out after {0}s")]
    Timeout(u64),
}

/// Escalation payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub incident_id: String,
    pub source_id: String,
    pub status: String,
    pub g_force: f64,
    pub tilt: f64,
    pub location: Option<GeoPoint>,
    pub channel: Channel,
    pub detected_at: DateTime<Utc>,
}

impl Escalation {
    pub fn from_incident(incident: &Incident) -> Self {
        Self {
            incident_id: incident.id.clone(),
            source_id: incident.source_id.clone(),
            status: status_label(incident.state).to_string(),
            g_force: incident.merged_telemetry.g_force_or_zero(),
            tilt: incident.merged_telemetry.tilt_or_zero(),
            location: incident.merged_telemetry.location,
            channel: incident.channel,
            detected_at: incident.created_at,
        }
    }

    /// Maps link for the location, if known
    pub fn maps_link(&self) -> Option<String> {
        self.location.map(|l| {
            format!(
                "https://www.google.com/maps?q={},{}",
                l.latitude, l.longitude
            )
        })
    }
}

/// Delivers escalations for HIGH-severity incidents
pub trait NotificationDispatcher: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn dispatch<'a>(&'a self, escalation: &'a Escalation) -> BoxFuture<'a, Result<(), DispatchError>>;
}
