//! Pool configuration.

use std::time::Duration;

use crate::error::Error;

/// Configuration for the connection pool.
///
/// Hooks (`on_connect`, `reset`, `validate`, `log`) are not part of this
/// struct; they are supplied through [`PoolBuilder`](crate::PoolBuilder).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Minimum number of connections to maintain.
    pub min_connections: u32,

    /// Maximum number of connections allowed, idle and in use combined.
    pub max_connections: u32,

    /// Time a connection can sit idle before the reaper closes it.
    pub idle_timeout: Duration,

    /// Interval between idle reaper runs.
    pub reap_interval: Duration,

    /// Whether idle connections are reaped at all.
    pub refresh_idle: bool,

    /// Number of priority levels for waiting acquisitions.
    pub priority_range: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(1),
            refresh_idle: true,
            priority_range: 1,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` pairs separated by `;`.
    ///
    /// Keys are case-insensitive and may be written in camelCase or
    /// snake_case:
    /// ```text
    /// min=2;max=10;idleTimeoutMillis=30000;reap_interval_millis=500
    /// ```
    /// Unknown keys are ignored.
    pub fn from_options_str(options: &str) -> Result<Self, Error> {
        let mut config = Self::default();

        for part in options.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| Error::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase().replace('_', "");
            let value = value.trim();

            match key.as_str() {
                "min" | "minconnections" => {
                    config.min_connections = parse_number(&key, value)?;
                }
                "max" | "maxconnections" => {
                    config.max_connections = parse_number(&key, value)?;
                }
                "idletimeoutmillis" | "idletimeoutms" => {
                    config.idle_timeout = Duration::from_millis(parse_number(&key, value)?);
                }
                "reapintervalmillis" | "reapintervalms" => {
                    config.reap_interval = Duration::from_millis(parse_number(&key, value)?);
                }
                "refreshidle" => {
                    config.refresh_idle = parse_bool(value);
                }
                "priorityrange" => {
                    config.priority_range = parse_number(&key, value)?;
                }
                _ => {
                    tracing::debug!(key = %key, value, "ignoring unknown pool option");
                }
            }
        }

        Ok(config)
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the interval between idle reaper runs.
    #[must_use]
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Enable or disable idle reaping.
    #[must_use]
    pub fn refresh_idle(mut self, enabled: bool) -> Self {
        self.refresh_idle = enabled;
        self
    }

    /// Set the number of waiter priority levels.
    #[must_use]
    pub fn priority_range(mut self, range: u32) -> Self {
        self.priority_range = range;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(Error::Configuration(
                "min_connections cannot be greater than max_connections".into(),
            ));
        }
        if self.priority_range == 0 {
            return Err(Error::Configuration(
                "priority_range must be at least 1".into(),
            ));
        }
        if self.refresh_idle && self.reap_interval.is_zero() {
            return Err(Error::Configuration(
                "reap_interval must be non-zero when refresh_idle is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid value for {key}: {value}")))
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1"
}
