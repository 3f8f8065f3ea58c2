//! Confidence scorer
//!
//! Weighted sum of two signals:
//! - impact above `g_crash` adds `impact_weight`
//! - tilt above `tilt_threshold_deg` adds `tilt_weight`
//!
//! An impact above `hard_impact_g` forces confidence to 1.0 regardless of
//! tilt. The verdict is positive when confidence reaches
//! `trigger_confidence` (inclusive).

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ScorerConfig;
use crate::sample::TelemetrySample;
use crate::DetectionError;

/// Why a sample was flagged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectionReason {
    None,
    Tilt,
    GForce,
    HardImpact,
}

impl DetectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionReason::None => "NONE",
            DetectionReason::Tilt => "TILT",
            DetectionReason::GForce => "G_FORCE",
            DetectionReason::HardImpact => "HARD_IMPACT",
        }
    }
}

/// Scoring result without the sample attached
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub detected: bool,
    pub confidence: f64,
    pub reason: DetectionReason,
}

/// Per-sample verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionVerdict {
    pub detected: bool,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reason: DetectionReason,
    pub sample: TelemetrySample,
}

impl DetectionVerdict {
    /// Verdict for a detection made by another channel's detector.
    ///
    /// The local assessment is kept for the record, but the verdict is
    /// positive: the originating device already decided, possibly with a
    /// different sensor calibration.
    pub fn reported(assessment: Assessment, sample: TelemetrySample) -> Self {
        Self {
            detected: true,
            confidence: assessment.confidence,
            reason: assessment.reason,
            sample,
        }
    }
}

/// Stateless crash scorer, safe to share between producers
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    config: ScorerConfig,
}

impl ConfidenceScorer {
    /// Create a scorer, validating thresholds
    pub fn new(config: ScorerConfig) -> Result<Self, DetectionError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Score a sample and attach it to the verdict
    pub fn score(&self, sample: TelemetrySample) -> DetectionVerdict {
        let assessment = self.assess(&sample);
        if assessment.detected {
            debug!(
                "Crash candidate from {}: confidence={:.2} reason={}",
                sample.source_id,
                assessment.confidence,
                assessment.reason.as_str()
            );
        }
        DetectionVerdict {
            detected: assessment.detected,
            confidence: assessment.confidence,
            reason: assessment.reason,
            sample,
        }
    }

    /// Score a sample by reference
    pub fn assess(&self, sample: &TelemetrySample) -> Assessment {
        let g = sample.effective_g_force();
        let tilt = sample.tilt_magnitude();

        let impact = g > self.config.g_crash;
        let hard_impact = g > self.config.hard_impact_g;
        let tilted = tilt > self.config.tilt_threshold_deg;

        let mut confidence = 0.0;
        if impact {
            confidence += self.config.impact_weight;
        }
        if tilted {
            confidence += self.config.tilt_weight;
        }
        if hard_impact {
            confidence = 1.0;
        }
        let confidence = confidence.clamp(0.0, 1.0);
        let detected = confidence >= self.config.trigger_confidence;

        let reason = if !detected {
            DetectionReason::None
        } else if hard_impact {
            DetectionReason::HardImpact
        } else if impact {
            DetectionReason::GForce
        } else if tilted {
            DetectionReason::Tilt
        } else {
            DetectionReason::None
        };

        Assessment {
            detected,
            confidence,
            reason,
        }
    }
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self {
            config: ScorerConfig::default(),
        }
    }
}
