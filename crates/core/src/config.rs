//! Configuration types for the engine.

use std::time::Duration;

/// Configuration for the [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between scheduler polls for due jobs.
    pub job_check_interval: Duration,
    /// Bound applied by [`Engine::shutdown`](crate::Engine::shutdown) while
    /// waiting for in-flight executions.
    pub shutdown_timeout: Duration,
    /// Seed for the backoff jitter generator; entropy when `None`.
    pub backoff_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_check_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            backoff_seed: None,
        }
    }
}

impl EngineConfig {
    /// Create a new builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interval between checks for due jobs.
    pub fn job_check_interval(mut self, interval: Duration) -> Self {
        self.config.job_check_interval = interval;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Seed the backoff jitter generator.
    pub fn backoff_seed(mut self, seed: u64) -> Self {
        self.config.backoff_seed = Some(seed);
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.job_check_interval, Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.backoff_seed.is_none());
    }

    #[test]
    fn test_engine_config_builder_fluent_chain() {
        let config = EngineConfig::builder()
            .job_check_interval(Duration::from_millis(50))
            .shutdown_timeout(Duration::from_secs(5))
            .backoff_seed(11)
            .build();

        assert_eq!(config.job_check_interval, Duration::from_millis(50));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.backoff_seed, Some(11));
    }

    #[test]
    fn test_engine_config_builder_debug() {
        let builder = EngineConfigBuilder::new();
        let debug = format!("{:?}", builder);
        assert!(debug.contains("EngineConfigBuilder"));
    }
}
