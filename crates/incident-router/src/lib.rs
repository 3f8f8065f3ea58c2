//! Incident Router
//!
//! Owns every open incident from admission to resolution:
//! - scores samples and admits them through the cooldown gate
//! - merges late telemetry from other channels
//! - runs one confirmation countdown task per incident
//! - classifies, escalates, persists and broadcasts the outcome

mod config;
mod dispatch;
mod incident;
mod router;

pub use config::RouterConfig;
pub use dispatch::{BoxFuture, DispatchError, Escalation, NotificationDispatcher};
pub use incident::{status_label, Incident, IncidentState, SignalOutcome};
pub use router::{IncidentRouter, IngestOutcome, RouterEvent};

use thiserror::Error;

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid router configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Detection(#[from] crash_detection::DetectionError),
    #[error(transparent)]
    Alerting(#[from] alerting::AlertError),
}
