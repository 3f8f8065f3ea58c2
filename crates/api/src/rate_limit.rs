//! Rate limiting for the simulation trigger
//!
//! GCRA per peer IP via tower_governor. Requires the service to be served
//! with `into_make_service_with_connect_info::<SocketAddr>()`.

use governor::middleware::StateInformationMiddleware;
use std::sync::Arc;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::PeerIpKeyExtractor;

use crate::settings::ServerConfig;
use crate::ApiError;

/// Governor config with X-RateLimit-* headers enabled
pub type SimulateGovernorConfig =
    tower_governor::governor::GovernorConfig<PeerIpKeyExtractor, StateInformationMiddleware>;

/// Quota for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Seconds to replenish one request
    pub per_second: u64,
    /// Requests allowed back to back
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 2,
            burst_size: 5,
        }
    }
}

impl From<&ServerConfig> for RateLimitConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            per_second: server.simulate_per_second,
            burst_size: server.simulate_burst,
        }
    }
}

/// Build the governor config for the simulation route
pub fn create_governor_config(config: &RateLimitConfig) -> Result<Arc<SimulateGovernorConfig>, ApiError> {
    GovernorConfigBuilder::default()
        .per_second(config.per_second)
        .burst_size(config.burst_size)
        .use_headers()
        .finish()
        .map(Arc::new)
        .ok_or_else(|| {
            ApiError::Config(format!(
                "invalid rate limit: per_second={}, burst={}",
                config.per_second, config.burst_size
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_server_config() {
        let server = ServerConfig {
            simulate_per_second: 4,
            simulate_burst: 2,
            ..Default::default()
        };
        assert_eq!(
            RateLimitConfig::from(&server),
            RateLimitConfig {
                per_second: 4,
                burst_size: 2
            }
        );
    }

    #[test]
    fn test_zero_quota_rejected() {
        let config = RateLimitConfig {
            per_second: 0,
            burst_size: 5,
        };
        assert!(create_governor_config(&config).is_err());
        assert!(create_governor_config(&RateLimitConfig::default()).is_ok());
    }
}
