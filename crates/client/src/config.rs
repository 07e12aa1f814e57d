//! Client configuration, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::realtime::ReconnectPolicy;

pub const ENV_API_URL: &str = "WAYBILL_API_URL";
pub const ENV_API_VERSION: &str = "WAYBILL_API_VERSION";
pub const ENV_REALTIME_URL: &str = "WAYBILL_REALTIME_URL";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "WAYBILL_REQUEST_TIMEOUT_SECS";
pub const ENV_STORE_PATH: &str = "WAYBILL_STORE_PATH";
pub const ENV_MAX_REPLAY_ATTEMPTS: &str = "WAYBILL_MAX_REPLAY_ATTEMPTS";
pub const ENV_DRAIN_INTERVAL_SECS: &str = "WAYBILL_DRAIN_INTERVAL_SECS";
pub const ENV_RECONNECT_BASE_MS: &str = "WAYBILL_RECONNECT_BASE_MS";
pub const ENV_RECONNECT_MAX_MS: &str = "WAYBILL_RECONNECT_MAX_MS";
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "WAYBILL_RECONNECT_MAX_ATTEMPTS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Where the persistent local store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    /// Nothing survives a restart; for tests and throwaway sessions.
    Memory,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST base, without the version segment.
    pub api_base_url: String,
    pub api_version: String,
    pub realtime_url: String,
    /// After this long a request counts as "still offline".
    pub request_timeout: Duration,
    pub store: StoreLocation,
    /// Transient replay failures tolerated before an operation needs attention.
    pub max_replay_attempts: u32,
    /// Safety-net drain period.
    pub drain_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".to_string(),
            api_version: "v1".to_string(),
            realtime_url: "ws://localhost:5000/ws".to_string(),
            request_timeout: Duration::from_secs(15),
            store: StoreLocation::File(default_store_path()),
            max_replay_attempts: 5,
            drain_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load from `WAYBILL_*` environment variables; unset ones keep defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &'static str| {
            let value = lookup(var).filter(|v| !v.trim().is_empty());
            if value.is_none() {
                tracing::debug!("{var} not set; using default");
            }
            value
        };

        if let Some(v) = get(ENV_API_URL) {
            config.api_base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get(ENV_API_VERSION) {
            config.api_version = v.trim_matches('/').to_string();
        }
        if let Some(v) = get(ENV_REALTIME_URL) {
            config.realtime_url = v;
        }
        if let Some(v) = get(ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout = Duration::from_secs(parse_number(ENV_REQUEST_TIMEOUT_SECS, &v)?);
        }
        if let Some(v) = get(ENV_STORE_PATH) {
            config.store = if v == ":memory:" {
                StoreLocation::Memory
            } else {
                StoreLocation::File(PathBuf::from(v))
            };
        }
        if let Some(v) = get(ENV_MAX_REPLAY_ATTEMPTS) {
            config.max_replay_attempts = parse_number(ENV_MAX_REPLAY_ATTEMPTS, &v)?;
        }
        if let Some(v) = get(ENV_DRAIN_INTERVAL_SECS) {
            config.drain_interval = Duration::from_secs(parse_number(ENV_DRAIN_INTERVAL_SECS, &v)?);
        }
        if let Some(v) = get(ENV_RECONNECT_BASE_MS) {
            config.reconnect.base_delay = Duration::from_millis(parse_number(ENV_RECONNECT_BASE_MS, &v)?);
        }
        if let Some(v) = get(ENV_RECONNECT_MAX_MS) {
            config.reconnect.max_delay = Duration::from_millis(parse_number(ENV_RECONNECT_MAX_MS, &v)?);
        }
        if let Some(v) = get(ENV_RECONNECT_MAX_ATTEMPTS) {
            config.reconnect.max_attempts = parse_number(ENV_RECONNECT_MAX_ATTEMPTS, &v)?;
        }

        if config.reconnect.max_delay < config.reconnect.base_delay {
            return Err(ConfigError::Invalid {
                var: ENV_RECONNECT_MAX_MS,
                value: config.reconnect.max_delay.as_millis().to_string(),
                reason: "must not be smaller than the base delay".to_string(),
            });
        }

        Ok(config)
    }

    /// `{base}/{version}`, the prefix every REST path is appended to.
    pub fn api_root(&self) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        if self.api_version.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{}", self.api_version)
        }
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `{app_data_dir}/waybill/offline.db`, falling back to the working directory.
pub fn default_store_path() -> PathBuf {
    let base = dirs::data_dir().or_else(|| {
        dirs::home_dir().map(|mut h| {
            h.push(".local");
            h.push("share");
            h
        })
    });

    match base {
        Some(mut dir) => {
            dir.push("waybill");
            dir.push("offline.db");
            dir
        }
        None => PathBuf::from("waybill-offline.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ClientConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_root(), "http://localhost:5000/v1");
        assert_eq!(config.request_timeout, Duration::from_secs(15));
        assert_eq!(config.max_replay_attempts, 5);
        assert!(matches!(config.store, StoreLocation::File(_)));
    }

    #[test]
    fn env_values_override_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_API_URL, "https://erp.example.com/"),
            (ENV_API_VERSION, "/v2/"),
            (ENV_STORE_PATH, ":memory:"),
            (ENV_RECONNECT_BASE_MS, "250"),
            (ENV_RECONNECT_MAX_ATTEMPTS, "3"),
        ]))
        .unwrap();

        assert_eq!(config.api_root(), "https://erp.example.com/v2");
        assert_eq!(config.store, StoreLocation::Memory);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_attempts, 3);
    }

    #[test]
    fn unparseable_values_name_the_variable() {
        let err = ClientConfig::from_lookup(lookup(&[(ENV_REQUEST_TIMEOUT_SECS, "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { var: ENV_REQUEST_TIMEOUT_SECS, .. }
        ));
    }

    #[test]
    fn max_delay_below_base_is_rejected() {
        let err = ClientConfig::from_lookup(lookup(&[
            (ENV_RECONNECT_BASE_MS, "5000"),
            (ENV_RECONNECT_MAX_MS, "100"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_RECONNECT_MAX_MS, .. }));
    }
}
