//! Pool manager configuration.

use std::time::Duration;

use tidepool_core::{ConfigError, ConfigResult, PoolSection, parse_duration};

/// Configuration for the connection pool manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Steady-state connections per target (default: 5).
    pub pool_size: usize,
    /// Extra transient connections per target above `pool_size` (default: 10).
    pub max_overflow: usize,
    /// Live connections across all targets (default: 100).
    pub global_max_connections: usize,
    /// Target pools tracked at once; the least recently used pool is
    /// evicted to admit a new target (default: 50).
    pub global_max_targets: usize,
    /// Idle connections older than this are closed by the reaper (default: 300s).
    pub idle_timeout: Duration,
    /// Period between reaper passes (default: 30s).
    pub reaper_interval: Duration,
    /// How long `acquire` waits when the caller passes no timeout (default: 30s).
    pub acquire_timeout_default: Duration,
    /// Ask the factory whether an idle connection is alive before lending it
    /// (default: true).
    pub health_check_on_acquire: bool,
    /// How long shutdown waits for borrowed connections to come back (default: 30s).
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            max_overflow: 10,
            global_max_connections: 100,
            global_max_targets: 50,
            idle_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            acquire_timeout_default: Duration::from_secs(30),
            health_check_on_acquire: true,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Hard per-target cap: `pool_size + max_overflow`.
    pub fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    /// Build a `PoolConfig` from the `[pool]` table of a `pool.toml`,
    /// falling back to defaults for unset fields.
    pub fn from_section(section: &PoolSection) -> ConfigResult<Self> {
        let defaults = Self::default();
        let duration_or = |value: &Option<String>, default: Duration| {
            value.as_deref().map_or(Ok(default), parse_duration)
        };

        let config = Self {
            pool_size: section.pool_size.unwrap_or(defaults.pool_size),
            max_overflow: section.max_overflow.unwrap_or(defaults.max_overflow),
            global_max_connections: section
                .global_max_connections
                .unwrap_or(defaults.global_max_connections),
            global_max_targets: section
                .global_max_targets
                .unwrap_or(defaults.global_max_targets),
            idle_timeout: duration_or(&section.idle_timeout, defaults.idle_timeout)?,
            reaper_interval: duration_or(&section.reaper_interval, defaults.reaper_interval)?,
            acquire_timeout_default: duration_or(
                &section.acquire_timeout_default,
                defaults.acquire_timeout_default,
            )?,
            health_check_on_acquire: section
                .health_check_on_acquire
                .unwrap_or(defaults.health_check_on_acquire),
            drain_timeout: duration_or(&section.drain_timeout, defaults.drain_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which no connection could ever be lent.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.global_max_connections == 0 {
            return Err(ConfigError::Invalid(
                "global_max_connections must be at least 1".into(),
            ));
        }
        if self.global_max_targets == 0 {
            return Err(ConfigError::Invalid(
                "global_max_targets must be at least 1".into(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "reaper_interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.max_overflow, 10);
        assert_eq!(config.capacity(), 15);
        assert_eq!(config.global_max_connections, 100);
        assert_eq!(config.global_max_targets, 50);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.acquire_timeout_default, Duration::from_secs(30));
        assert!(config.health_check_on_acquire);
        assert_eq!(config.drain_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_section_yields_defaults() {
        let config = PoolConfig::from_section(&PoolSection::default()).unwrap();
        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    fn from_section_maps_fields() {
        let section = PoolSection {
            pool_size: Some(2),
            max_overflow: Some(0),
            global_max_connections: Some(8),
            global_max_targets: Some(3),
            idle_timeout: Some("90s".into()),
            reaper_interval: Some("500ms".into()),
            acquire_timeout_default: Some("2s".into()),
            health_check_on_acquire: Some(false),
            drain_timeout: Some("1m".into()),
        };
        let config = PoolConfig::from_section(&section).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.capacity(), 2);
        assert_eq!(config.global_max_connections, 8);
        assert_eq!(config.global_max_targets, 3);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.reaper_interval, Duration::from_millis(500));
        assert_eq!(config.acquire_timeout_default, Duration::from_secs(2));
        assert!(!config.health_check_on_acquire);
        assert_eq!(config.drain_timeout, Duration::from_secs(60));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let section = PoolSection {
            idle_timeout: Some("forever".into()),
            ..PoolSection::default()
        };
        assert!(matches!(
            PoolConfig::from_section(&section),
            Err(ConfigError::InvalidDuration { .. })
        ));
    }

    #[test]
    fn zero_caps_are_rejected() {
        for section in [
            PoolSection { pool_size: Some(0), ..PoolSection::default() },
            PoolSection { global_max_connections: Some(0), ..PoolSection::default() },
            PoolSection { global_max_targets: Some(0), ..PoolSection::default() },
            PoolSection { reaper_interval: Some("0s".into()), ..PoolSection::default() },
        ] {
            assert!(
                matches!(PoolConfig::from_section(&section), Err(ConfigError::Invalid(_))),
                "{section:?} should be rejected"
            );
        }
    }
}
