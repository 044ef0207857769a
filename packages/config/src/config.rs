// ABOUTME: Typed runtime configuration loaded from environment variables
// ABOUTME: Validates timeouts, poll interval and image pull policy before anything starts

use crate::constants::*;
use std::env;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://kubedock.db";
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_REAPER_MAX_AGE_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {source}")]
    InvalidNumber {
        name: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("Invalid image pull policy: {0} (expected Always, IfNotPresent or Never)")]
    InvalidPullPolicy(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl ImagePullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImagePullPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "ifnotpresent" => Ok(Self::IfNotPresent),
            "never" => Ok(Self::Never),
            _ => Err(ConfigError::InvalidPullPolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub namespace: String,
    pub database_url: String,
    pub image_pull_policy: ImagePullPolicy,
    pub ready_timeout: Duration,
    pub delete_timeout: Duration,
    pub poll_interval: Duration,
    pub reaper_max_age: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = lookup(KUBEDOCK_NAMESPACE)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        if namespace.is_empty() {
            return Err(ConfigError::Empty(KUBEDOCK_NAMESPACE));
        }

        let database_url =
            lookup(KUBEDOCK_DATABASE_URL).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::Empty(KUBEDOCK_DATABASE_URL));
        }

        let image_pull_policy = match lookup(KUBEDOCK_IMAGE_PULL_POLICY) {
            Some(value) => value.trim().parse::<ImagePullPolicy>()?,
            None => ImagePullPolicy::IfNotPresent,
        };

        let ready_timeout = Duration::from_secs(positive(
            &lookup,
            KUBEDOCK_READY_TIMEOUT_SECS,
            DEFAULT_READY_TIMEOUT_SECS,
        )?);
        let delete_timeout = Duration::from_secs(positive(
            &lookup,
            KUBEDOCK_DELETE_TIMEOUT_SECS,
            DEFAULT_DELETE_TIMEOUT_SECS,
        )?);
        let poll_interval = Duration::from_millis(positive(
            &lookup,
            KUBEDOCK_POLL_INTERVAL_MS,
            DEFAULT_POLL_INTERVAL_MS,
        )?);
        let reaper_max_age = Duration::from_secs(positive(
            &lookup,
            KUBEDOCK_REAPER_MAX_AGE_SECS,
            DEFAULT_REAPER_MAX_AGE_SECS,
        )?);

        let log_level = lookup(KUBEDOCK_LOG_LEVEL)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let config = Config {
            namespace,
            database_url,
            image_pull_policy,
            ready_timeout,
            delete_timeout,
            poll_interval,
            reaper_max_age,
            log_level,
        };
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            image_pull_policy: ImagePullPolicy::IfNotPresent,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            delete_timeout: Duration::from_secs(DEFAULT_DELETE_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            reaper_max_age: Duration::from_secs(DEFAULT_REAPER_MAX_AGE_SECS),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

fn positive<F>(lookup: &F, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|source| ConfigError::InvalidNumber { name, source })?,
        None => default,
    };
    if value == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_custom_values() {
        let config = Config::from_lookup(lookup_from(&[
            (KUBEDOCK_NAMESPACE, "ci"),
            (KUBEDOCK_DATABASE_URL, "sqlite:///tmp/k.db"),
            (KUBEDOCK_READY_TIMEOUT_SECS, "120"),
            (KUBEDOCK_DELETE_TIMEOUT_SECS, "15"),
            (KUBEDOCK_POLL_INTERVAL_MS, "250"),
            (KUBEDOCK_IMAGE_PULL_POLICY, "Always"),
            (KUBEDOCK_LOG_LEVEL, "debug"),
        ]))
        .unwrap();

        assert_eq!(config.namespace, "ci");
        assert_eq!(config.database_url, "sqlite:///tmp/k.db");
        assert_eq!(config.ready_timeout, Duration::from_secs(120));
        assert_eq!(config.delete_timeout, Duration::from_secs(15));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.image_pull_policy, ImagePullPolicy::Always);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = Config::from_lookup(lookup_from(&[(KUBEDOCK_READY_TIMEOUT_SECS, "0")]));
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ZeroDuration(KUBEDOCK_READY_TIMEOUT_SECS)
        ));
    }

    #[test]
    fn test_blank_namespace_rejected() {
        let result = Config::from_lookup(lookup_from(&[(KUBEDOCK_NAMESPACE, "  ")]));
        assert!(matches!(result.unwrap_err(), ConfigError::Empty(_)));
    }

    #[rstest]
    #[case("-1")]
    #[case("1.5")]
    #[case("ten")]
    #[case("")]
    fn test_invalid_numbers(#[case] raw: &str) {
        let result = Config::from_lookup(lookup_from(&[(KUBEDOCK_POLL_INTERVAL_MS, raw)]));
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
        assert!(err.to_string().contains(KUBEDOCK_POLL_INTERVAL_MS));
    }

    #[rstest]
    #[case("Always", ImagePullPolicy::Always)]
    #[case("ifnotpresent", ImagePullPolicy::IfNotPresent)]
    #[case("NEVER", ImagePullPolicy::Never)]
    fn test_pull_policy_parsing(#[case] raw: &str, #[case] expected: ImagePullPolicy) {
        assert_eq!(raw.parse::<ImagePullPolicy>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_pull_policy() {
        let err = "Sometimes".parse::<ImagePullPolicy>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid image pull policy: Sometimes (expected Always, IfNotPresent or Never)"
        );
    }
}
