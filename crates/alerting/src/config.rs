//! Alerting configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::AlertError;

/// Cooldown and confirmation window settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Minimum spacing between confirmed incidents of one source (seconds)
    pub cooldown_seconds: u64,
    /// How long the rider has to cancel (milliseconds)
    pub confirmation_window_ms: u64,
    /// Countdown refresh period for display (milliseconds)
    pub countdown_tick_ms: u64,
    /// Start the cooldown after a cancelled incident as well
    pub cooldown_on_cancel: bool,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: 30,
            confirmation_window_ms: 10_000,
            countdown_tick_ms: 1_000,
            cooldown_on_cancel: false,
        }
    }
}

impl AlertingConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn confirmation_window(&self) -> Duration {
        Duration::from_millis(self.confirmation_window_ms)
    }

    pub fn countdown_tick(&self) -> Duration {
        Duration::from_millis(self.countdown_tick_ms)
    }

    pub fn validate(&self) -> Result<(), AlertError> {
        if self.confirmation_window_ms == 0 {
            return Err(AlertError::InvalidConfig(
                "confirmation window must be non-zero".to_string(),
            ));
        }
        if self.countdown_tick_ms == 0 {
            return Err(AlertError::InvalidConfig(
                "countdown tick must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
