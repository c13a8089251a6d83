//! Pool configuration, resolved once from the environment at startup.

use std::time::Duration;

use crate::backend::digitalocean::{
    DEFAULT_API_BASE_URL, DEFAULT_REGION_ID, DEFAULT_SIZE_ID, DigitalOceanConfig,
};
use crate::coordinator::CoordinatorConfig;
use crate::host::pool_prefix;
use crate::lifecycle::LifecycleConfig;

/// Keys that must be present and non-empty.
pub const REQUIRED_KEYS: [&str; 7] = [
    "PORT",
    "CLIENT_ID",
    "API_KEY",
    "IMAGE",
    "CONCURRENCY",
    "NAME",
    "TIMEOUT",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub host: String,
    pub port: u16,
    /// Pool name; every host is named `{name}.…`.
    pub name: String,
    pub capacity: usize,
    /// How long a host lives after it is handed out.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub backend: DigitalOceanConfig,
}

impl PoolConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve from an arbitrary key lookup. Empty values count as absent.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<&'static str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|&key| get(key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &'static str| get(key).unwrap_or_default();

        let port = parse::<u16>("PORT", &required("PORT"))?;
        let capacity = parse_positive("CONCURRENCY", &required("CONCURRENCY"))?;
        let timeout_secs = parse_positive("TIMEOUT", &required("TIMEOUT"))?
            .checked_mul(60)
            .ok_or(ConfigError::Invalid {
                key: "TIMEOUT",
                reason: "too large".to_string(),
            })?;
        let poll_secs = match get("POLL_INTERVAL_SECS") {
            Some(v) => parse_positive("POLL_INTERVAL_SECS", &v)?,
            None => 5,
        };
        let heartbeat_secs = match get("HEARTBEAT_INTERVAL_SECS") {
            Some(v) => parse_positive("HEARTBEAT_INTERVAL_SECS", &v)?,
            None => 15,
        };

        let mut backend =
            DigitalOceanConfig::new(required("CLIENT_ID"), required("API_KEY"), required("IMAGE"));
        backend.ssh_key_ids = get("KEY");
        backend.region_id = get("REGION").unwrap_or_else(|| DEFAULT_REGION_ID.to_string());
        backend.size_id = get("SIZE").unwrap_or_else(|| DEFAULT_SIZE_ID.to_string());
        backend.api_base_url =
            get("API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        Ok(Self {
            host: get("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            name: required("NAME"),
            capacity: capacity as usize,
            timeout: Duration::from_secs(timeout_secs),
            poll_interval: Duration::from_secs(poll_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            backend,
        })
    }

    /// Prefix the reconciler matches on.
    pub fn prefix(&self) -> String {
        pool_prefix(&self.name)
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            pool_name: self.name.clone(),
            timeout: self.timeout,
            lifecycle: LifecycleConfig {
                settle_delay: self.poll_interval,
                poll_interval: self.poll_interval,
            },
        }
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("{value:?}: {e}"),
    })
}

fn parse_positive(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            reason: "must be at least 1".to_string(),
        }),
        n => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: [(&str, &str); 7] = [
        ("PORT", "8080"),
        ("CLIENT_ID", "client"),
        ("API_KEY", "secret"),
        ("IMAGE", "12345"),
        ("CONCURRENCY", "3"),
        ("NAME", "ci"),
        ("TIMEOUT", "10"),
    ];

    #[test]
    fn resolves_required_and_defaults() {
        let config = PoolConfig::from_lookup(lookup(&BASE)).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.capacity, 3);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.prefix(), "ci.");
        assert_eq!(config.backend.region_id, "1");
        assert_eq!(config.backend.size_id, "66");
        assert_eq!(config.backend.image_id, "12345");
        assert!(config.backend.ssh_key_ids.is_none());
    }

    #[test]
    fn optional_keys_override_defaults() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("KEY", "99"),
            ("REGION", "4"),
            ("SIZE", "62"),
            ("POLL_INTERVAL_SECS", "1"),
            ("API_BASE_URL", "http://localhost:9000"),
        ]);
        let config = PoolConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.backend.ssh_key_ids.as_deref(), Some("99"));
        assert_eq!(config.backend.region_id, "4");
        assert_eq!(config.backend.size_id, "62");
        assert_eq!(config.backend.api_base_url, "http://localhost:9000");

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.lifecycle.poll_interval, Duration::from_secs(1));
        assert_eq!(coordinator.lifecycle.settle_delay, Duration::from_secs(1));
    }

    #[test]
    fn reports_every_missing_key() {
        let err = PoolConfig::from_lookup(lookup(&[("PORT", "8080"), ("NAME", "")])).unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @"missing required configuration: CLIENT_ID, API_KEY, IMAGE, CONCURRENCY, NAME, TIMEOUT"
        );
    }

    #[test]
    fn zero_concurrency_is_invalid() {
        let mut pairs = BASE.to_vec();
        pairs.retain(|(k, _)| *k != "CONCURRENCY");
        pairs.push(("CONCURRENCY", "0"));

        let err = PoolConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "CONCURRENCY",
                reason: "must be at least 1".to_string(),
            }
        );
    }

    #[test]
    fn non_numeric_timeout_is_invalid() {
        let mut pairs = BASE.to_vec();
        pairs.retain(|(k, _)| *k != "TIMEOUT");
        pairs.push(("TIMEOUT", "soon"));

        let err = PoolConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "TIMEOUT", .. }));
    }

    #[test]
    fn overflowing_timeout_is_invalid() {
        let huge = u64::MAX.to_string();
        let mut pairs: Vec<(&str, &str)> = BASE.to_vec();
        pairs.retain(|(k, _)| *k != "TIMEOUT");
        pairs.push(("TIMEOUT", huge.as_str()));

        let err = PoolConfig::from_lookup(lookup(&pairs)).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"invalid TIMEOUT: too large");
    }
}
