//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ConfigError, KeelError, KeelResult};

/// Eviction priority for cached results. Lower priorities are evicted first
/// when a capacity limit is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CachePriority {
    Low,
    Normal,
    High,
    /// Never evicted for capacity; still expires.
    NeverRemove,
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false, repositories bypass the cache entirely.
    pub enabled: bool,
    /// Lifetime of an entry measured from insertion.
    pub absolute_expiration: Duration,
    /// Idle lifetime of an entry, refreshed on every hit.
    pub sliding_expiration: Duration,
    /// Priority given to every entry the repositories insert.
    pub priority: CachePriority,
    /// Optional capacity; `None` means unbounded.
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            absolute_expiration: Duration::from_secs(5 * 60),
            sliding_expiration: Duration::from_secs(2 * 60),
            priority: CachePriority::Normal,
            max_entries: None,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Config with caching switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_absolute_expiration(mut self, duration: Duration) -> Self {
        self.absolute_expiration = duration;
        self
    }

    pub fn with_sliding_expiration(mut self, duration: Duration) -> Self {
        self.sliding_expiration = duration;
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Load from `KEEL_CACHE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            enabled: std::env::var("KEEL_CACHE_ENABLED")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.enabled),
            absolute_expiration: std::env::var("KEEL_CACHE_ABSOLUTE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.absolute_expiration),
            sliding_expiration: std::env::var("KEEL_CACHE_SLIDING_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sliding_expiration),
            priority: defaults.priority,
            max_entries: std::env::var("KEEL_CACHE_MAX_ENTRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .or(defaults.max_entries),
        }
    }

    pub fn validate(&self) -> KeelResult<()> {
        if self.absolute_expiration.is_zero() {
            return Err(KeelError::Config(ConfigError::InvalidValue {
                field: "absolute_expiration".to_string(),
                value: format!("{:?}", self.absolute_expiration),
                reason: "absolute_expiration must be greater than zero".to_string(),
            }));
        }

        if self.sliding_expiration.is_zero() {
            return Err(KeelError::Config(ConfigError::InvalidValue {
                field: "sliding_expiration".to_string(),
                value: format!("{:?}", self.sliding_expiration),
                reason: "sliding_expiration must be greater than zero".to_string(),
            }));
        }

        if self.max_entries == Some(0) {
            return Err(KeelError::Config(ConfigError::InvalidValue {
                field: "max_entries".to_string(),
                value: "0".to_string(),
                reason: "max_entries must be greater than 0 when set".to_string(),
            }));
        }

        Ok(())
    }
}

/// Top-level configuration for a data context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeelConfig {
    pub cache: CacheConfig,
    /// Page size used when a caller asks for a page without choosing one.
    pub default_page_size: usize,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            default_page_size: 25,
        }
    }
}

impl KeelConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            cache: CacheConfig::from_env(),
            default_page_size: std::env::var("KEEL_DEFAULT_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_page_size),
        }
    }

    pub fn validate(&self) -> KeelResult<()> {
        self.cache.validate()?;

        if self.default_page_size == 0 {
            return Err(KeelError::Config(ConfigError::InvalidValue {
                field: "default_page_size".to_string(),
                value: "0".to_string(),
                reason: "default_page_size must be greater than 0".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.absolute_expiration, Duration::from_secs(300));
        assert_eq!(config.sliding_expiration, Duration::from_secs(120));
        assert_eq!(config.priority, CachePriority::Normal);
        assert_eq!(config.max_entries, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_builder() {
        let config = CacheConfig::new()
            .with_absolute_expiration(Duration::from_secs(60))
            .with_sliding_expiration(Duration::from_secs(10))
            .with_priority(CachePriority::High)
            .with_max_entries(100)
            .with_enabled(false);

        assert!(!config.enabled);
        assert_eq!(config.absolute_expiration, Duration::from_secs(60));
        assert_eq!(config.sliding_expiration, Duration::from_secs(10));
        assert_eq!(config.priority, CachePriority::High);
        assert_eq!(config.max_entries, Some(100));
    }

    #[test]
    fn test_cache_config_rejects_zero_durations() {
        let err = CacheConfig::new()
            .with_sliding_expiration(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            KeelError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "sliding_expiration"
        ));
        assert!(CacheConfig::new()
            .with_absolute_expiration(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CacheConfig::new().with_max_entries(0).validate().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(CachePriority::Low < CachePriority::Normal);
        assert!(CachePriority::Normal < CachePriority::High);
        assert!(CachePriority::High < CachePriority::NeverRemove);
    }

    #[test]
    fn test_keel_config_validate() {
        assert!(KeelConfig::default().validate().is_ok());
        let config = KeelConfig {
            default_page_size: 0,
            ..KeelConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = KeelConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: KeelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
