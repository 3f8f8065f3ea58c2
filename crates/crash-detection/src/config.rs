//! Scorer configuration

use serde::{Deserialize, Serialize};

use crate::DetectionError;

/// Confidence scorer configuration
///
/// The defaults are the canonical threshold set for the whole relay. Every
/// channel (mobile, helmet device, dashboard simulation) is scored with the
/// same values so an incident means the same thing regardless of origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Impact magnitude that counts as a crash signal (g)
    pub g_crash: f64,

    /// Impact magnitude that forces full confidence (g)
    pub hard_impact_g: f64,

    /// Tilt beyond which the helmet is considered down (degrees)
    pub tilt_threshold_deg: f64,

    /// Confidence contributed by an impact above `g_crash`
    pub impact_weight: f64,

    /// Confidence contributed by tilt above `tilt_threshold_deg`
    pub tilt_weight: f64,

    /// Minimum confidence for a positive verdict (inclusive)
    pub trigger_confidence: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            g_crash: 6.5,
            hard_impact_g: 9.0,
            tilt_threshold_deg: 60.0,
            impact_weight: 0.4,
            tilt_weight: 0.4,
            trigger_confidence: 0.7,
        }
    }
}

impl ScorerConfig {
    /// Reject configurations that can never (or always) trigger.
    pub fn validate(&self) -> Result<(), DetectionError> {
        let finite = [
            self.g_crash,
            self.hard_impact_g,
            self.tilt_threshold_deg,
            self.impact_weight,
            self.tilt_weight,
            self.trigger_confidence,
        ]
        .iter()
        .all(|v| v.is_finite());

        if !finite {
            return Err(DetectionError::InvalidConfig(
                "thresholds must be finite".to_string(),
            ));
        }
        if self.g_crash <= 0.0 || self.hard_impact_g <= 0.0 {
            return Err(DetectionError::InvalidConfig(
                "g-force thresholds must be positive".to_string(),
            ));
        }
        if self.hard_impact_g < self.g_crash {
            return Err(DetectionError::InvalidConfig(format!(
                "hard impact threshold {}g is below crash threshold {}g",
                self.hard_impact_g, self.g_crash
            )));
        }
        if !(0.0..=180.0).contains(&self.tilt_threshold_deg) {
            return Err(DetectionError::InvalidConfig(format!(
                "tilt threshold {} outside [0, 180]",
                self.tilt_threshold_deg
            )));
        }
        if self.impact_weight < 0.0 || self.tilt_weight < 0.0 {
            return Err(DetectionError::InvalidConfig(
                "weights must not be negative".to_string(),
            ));
        }
        if self.trigger_confidence <= 0.0 || self.trigger_confidence > 1.0 {
            return Err(DetectionError::InvalidConfig(format!(
                "trigger confidence {} outside (0, 1]",
                self.trigger_confidence
            )));
        }
        Ok(())
    }
}
