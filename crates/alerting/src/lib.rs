//! Alerting
//!
//! Provides duplicate-detection suppression per source and the cancellable
//! confirmation countdown that decides escalation.

mod config;
mod cooldown;
mod timer;

pub use config::AlertingConfig;
pub use cooldown::{AdmitDecision, CooldownGate, CooldownRecord};
pub use timer::{ConfirmationTimer, TimerExit, TimerState};

use thiserror::Error;

/// Alerting errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AlertError {
    #[error("Invalid alerting configuration: {0}")]
    InvalidConfig(String),
}
