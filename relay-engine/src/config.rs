//! Engine configuration
//!
//! Connection, pool and notification settings, read from the environment.

use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL; without it run state is kept in memory
    pub database_url: Option<String>,

    /// Address the HTTP API binds to
    pub bind_addr: String,

    /// Maximum connections in the database pool
    pub max_connections: u32,

    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,

    /// Snapshot events buffered per watcher before the slowest one lags
    pub event_buffer: usize,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - DATABASE_URL (optional, in-memory store when unset)
    /// - RELAY_BIND_ADDR (optional, default: 0.0.0.0:8080)
    /// - DB_MAX_CONNECTIONS (optional, default: 10)
    /// - DB_ACQUIRE_TIMEOUT (optional, seconds, default: 5)
    /// - EVENT_BUFFER (optional, default: 256)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let bind_addr = std::env::var("RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let max_connections = parse_var("DB_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections);

        let acquire_timeout = parse_var::<u64>("DB_ACQUIRE_TIMEOUT")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.acquire_timeout);

        let event_buffer = parse_var("EVENT_BUFFER")?.unwrap_or(defaults.event_buffer);

        Ok(Self {
            database_url,
            bind_addr,
            max_connections,
            acquire_timeout,
            event_buffer,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("DATABASE_URL must start with postgres:// or postgresql://");
            }
        }

        if self.bind_addr.trim().is_empty() {
            anyhow::bail!("bind_addr cannot be empty");
        }

        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be greater than 0");
        }

        if self.acquire_timeout.is_zero() {
            anyhow::bail!("acquire_timeout must be greater than 0");
        }

        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            event_buffer: 256,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(None),
    }
}
