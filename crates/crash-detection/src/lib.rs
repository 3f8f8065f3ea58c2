//! Crash Detection
//!
//! Turns raw helmet telemetry into detection verdicts:
//! - Telemetry samples from mobile sensors, the helmet device or simulations
//! - Confidence scoring over impact magnitude and tilt
//! - Hard-impact override

pub mod config;
pub mod sample;
pub mod scorer;

pub use config::ScorerConfig;
pub use sample::{GeoPoint, TelemetrySample, Vec3};
pub use scorer::{Assessment, ConfidenceScorer, DetectionReason, DetectionVerdict};

use thiserror::Error;

/// Detection error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectionError {
    #[error("Invalid scorer configuration: {0}")]
    InvalidConfig(String),
}
