//! Server configuration from environment variables

use crate::error::{Result, ServerError};
use file_stash::StashConfig;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3002;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub stash: StashConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            stash: StashConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parse configuration from any key/value source. Unset keys take
    /// their defaults; set but invalid values are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = match lookup("PORT") {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .map_err(|_| ServerError::Config(format!("PORT is not a valid port: {}", v)))?,
            None => defaults.port,
        };

        let stash_dir = lookup("STASH_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.stash.stash_dir);

        let max_item_age = match lookup("MAX_ITEM_AGE_MS") {
            Some(v) => positive_millis("MAX_ITEM_AGE_MS", &v)?,
            None => defaults.stash.max_item_age,
        };

        let sweep_interval = match lookup("SWEEP_INTERVAL_MS") {
            Some(v) => positive_millis("SWEEP_INTERVAL_MS", &v)?,
            None => defaults.stash.sweep_interval,
        };

        let delete_after_access = match lookup("DELETE_AFTER_ACCESS") {
            Some(v) => parse_bool("DELETE_AFTER_ACCESS", &v)?,
            None => defaults.stash.delete_after_access,
        };

        Ok(Self {
            port,
            stash: StashConfig {
                stash_dir,
                max_item_age,
                delete_after_access,
                sweep_interval,
            },
        })
    }
}

fn positive_millis(key: &str, value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ServerError::Config(format!(
            "{} must be a positive number of milliseconds, got {:?}",
            key, value
        ))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ServerError::Config(format!(
            "{} must be true or false, got {:?}",
            key, value
        ))),
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

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3002);
        assert_eq!(config.stash.stash_dir, std::env::temp_dir().join("stashDir"));
        assert_eq!(config.stash.max_item_age, Duration::from_millis(5000));
        assert_eq!(config.stash.sweep_interval, Duration::from_millis(1000));
        assert!(config.stash.delete_after_access);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("STASH_DIR", "/var/stash"),
            ("MAX_ITEM_AGE_MS", "60000"),
            ("SWEEP_INTERVAL_MS", "250"),
            ("DELETE_AFTER_ACCESS", "False"),
        ]))
        .unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.stash.stash_dir, PathBuf::from("/var/stash"));
        assert_eq!(config.stash.max_item_age, Duration::from_secs(60));
        assert_eq!(config.stash.sweep_interval, Duration::from_millis(250));
        assert!(!config.stash.delete_after_access);
    }

    #[test]
    fn test_rejects_zero_durations() {
        let result = ServerConfig::from_lookup(lookup(&[("MAX_ITEM_AGE_MS", "0")]));
        assert!(matches!(result, Err(ServerError::Config(_))));

        let result = ServerConfig::from_lookup(lookup(&[("SWEEP_INTERVAL_MS", "soon")]));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }

    #[test]
    fn test_rejects_unparseable_flag() {
        let result = ServerConfig::from_lookup(lookup(&[("DELETE_AFTER_ACCESS", "maybe")]));
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
