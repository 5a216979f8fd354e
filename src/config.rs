use std::env;
use std::time::Duration;

use tracing::debug;

use crate::batch_allocator::AllocatorConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    pub redis_url: String,
    /// How long staged rows of an unfinished allocation survive in Redis.
    pub staging_ttl: Duration,
    pub allocator: AllocatorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            redis_url: "redis://localhost:6379/".to_string(),
            staging_ttl: Duration::from_secs(300),
            allocator: AllocatorConfig::default(),
        }
    }
}

impl Config {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse("PORT", port)?;
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(ttl) = lookup("STAGING_TTL_SECS") {
            config.staging_ttl = Duration::from_secs(parse_positive("STAGING_TTL_SECS", ttl)?);
        }
        if let Some(size) = lookup("MAX_BATCH_SIZE") {
            config.allocator.max_batch_size = parse_positive("MAX_BATCH_SIZE", size)?;
        }
        if let Some(size) = lookup("CHUNK_SIZE") {
            config.allocator.chunk_size = parse_positive("CHUNK_SIZE", size)?;
        }
        if let Some(secs) = lookup("ALLOCATION_TIMEOUT_SECS") {
            config.allocator.timeout =
                Duration::from_secs(parse_positive("ALLOCATION_TIMEOUT_SECS", secs)?);
        }

        debug!(?config, "configuration loaded");
        Ok(config)
    }
}

fn parse<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
        value,
    })
}

fn parse_positive(name: &'static str, value: String) -> Result<u64, ConfigError> {
    let parsed: u64 = parse(name, value.clone())?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            name,
            value,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.redis_url, "redis://localhost:6379/");
        assert_eq!(config.allocator.max_batch_size, 100_000);
        assert_eq!(config.allocator.chunk_size, 1_000);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "9090"),
            ("REDIS_URL", "redis://cache:6379/2"),
            ("MAX_BATCH_SIZE", "5000"),
            ("CHUNK_SIZE", "250"),
            ("ALLOCATION_TIMEOUT_SECS", "5"),
            ("STAGING_TTL_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9090);
        assert_eq!(config.redis_url, "redis://cache:6379/2");
        assert_eq!(config.allocator.max_batch_size, 5000);
        assert_eq!(config.allocator.chunk_size, 250);
        assert_eq!(config.allocator.timeout, Duration::from_secs(5));
        assert_eq!(config.staging_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("PORT", "http")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = Config::from_lookup(lookup(&[("CHUNK_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }
}
