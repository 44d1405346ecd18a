//! Configuration for the cache facade.

use std::time::Duration;

/// Tunables for a [`Cache`](crate::Cache) instance.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used by the `*_with_default_ttl` conveniences.
    pub default_ttl: Duration,
    /// Whether re-declaring a collection's context filter with a
    /// different pattern is rejected. Disabling this makes the newest
    /// filter win, for deployments that rotate filter shapes on purpose.
    pub enforce_filter_consistency: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            enforce_filter_consistency: true,
        }
    }
}

impl CacheConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Enable or disable the conflicting-filter check.
    pub fn with_filter_consistency(mut self, enforce: bool) -> Self {
        self.enforce_filter_consistency = enforce;
        self
    }
}
