//! Router configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RouterError;

/// Router configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Escalate HIGH incidents even when no location is known
    pub escalate_without_location: bool,
    /// Capacity of the lifecycle broadcast channel
    pub broadcast_capacity: usize,
    /// Upper bound on one dispatcher call (seconds)
    pub dispatch_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            escalate_without_location: true,
            broadcast_capacity: 64,
            dispatch_timeout_secs: 15,
        }
    }
}

impl RouterConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.broadcast_capacity == 0 {
            return Err(RouterError::InvalidConfig(
                "broadcast_capacity must be positive".to_string(),
            ));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(RouterError::InvalidConfig(
                "dispatch_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
