//! Environment configuration (`POSTDECK_*`), parsed once at startup.

#![forbid(unsafe_code)]

use std::time::Duration;

use postdeck_stream::ReconnectPolicy;

use crate::edit::RetryPolicy;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{key}: must be greater than zero")]
    Zero { key: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub api_url: String,
    pub events_url: String,
    pub page_size: u32,
    pub protect: Duration,
    pub stabilize: Duration,
    pub retry_delays: Vec<Duration>,
    pub request_timeout: Duration,
    pub hard_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max_attempts: u32,
    pub reconnect_cooldown: Duration,
    pub queue_cap: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            events_url: format!("{DEFAULT_API_URL}/events"),
            page_size: 50,
            protect: Duration::from_millis(8000),
            stabilize: Duration::from_millis(2000),
            retry_delays: vec![Duration::from_millis(1000), Duration::from_millis(2000), Duration::from_millis(4000)],
            request_timeout: Duration::from_millis(15_000),
            hard_timeout: Duration::from_millis(30_000),
            reconnect_base: Duration::from_millis(1000),
            reconnect_max_attempts: 10,
            reconnect_cooldown: Duration::from_secs(300),
            queue_cap: 2048,
        }
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw.to_string() })
}

fn positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(key, raw)? {
        0 => Err(ConfigError::Zero { key }),
        n => Ok(n),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = get("POSTDECK_API_URL") {
            cfg.api_url = v.trim_end_matches('/').to_string();
        }
        cfg.events_url = match get("POSTDECK_EVENTS_URL") {
            Some(v) => v,
            None => format!("{}/events", cfg.api_url),
        };
        if let Some(v) = get("POSTDECK_PAGE_SIZE") {
            let key = "POSTDECK_PAGE_SIZE";
            cfg.page_size = u32::try_from(positive(key, &v)?).map_err(|_| ConfigError::Invalid { key, value: v })?;
        }
        if let Some(v) = get("POSTDECK_PROTECT_MS") {
            cfg.protect = Duration::from_millis(positive("POSTDECK_PROTECT_MS", &v)?);
        }
        if let Some(v) = get("POSTDECK_STABILIZE_MS") {
            cfg.stabilize = Duration::from_millis(parse("POSTDECK_STABILIZE_MS", &v)?);
        }
        if let Some(v) = get("POSTDECK_RETRY_DELAYS_MS") {
            cfg.retry_delays = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse::<u64>("POSTDECK_RETRY_DELAYS_MS", s).map(Duration::from_millis))
                .collect::<Result<_, _>>()?;
        }
        if let Some(v) = get("POSTDECK_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout = Duration::from_millis(positive("POSTDECK_REQUEST_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("POSTDECK_HARD_TIMEOUT_MS") {
            cfg.hard_timeout = Duration::from_millis(positive("POSTDECK_HARD_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("POSTDECK_RECONNECT_BASE_MS") {
            cfg.reconnect_base = Duration::from_millis(positive("POSTDECK_RECONNECT_BASE_MS", &v)?);
        }
        if let Some(v) = get("POSTDECK_RECONNECT_MAX_ATTEMPTS") {
            cfg.reconnect_max_attempts = parse("POSTDECK_RECONNECT_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("POSTDECK_RECONNECT_COOLDOWN_SECS") {
            cfg.reconnect_cooldown = Duration::from_secs(parse("POSTDECK_RECONNECT_COOLDOWN_SECS", &v)?);
        }
        if let Some(v) = get("POSTDECK_QUEUE_CAP") {
            cfg.queue_cap = positive("POSTDECK_QUEUE_CAP", &v)? as usize;
        }
        Ok(cfg)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: self.reconnect_base,
            max_attempts: self.reconnect_max_attempts,
            cooldown: self.reconnect_cooldown,
            ..ReconnectPolicy::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy { RetryPolicy::new(self.retry_delays.clone()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, SyncConfig::default());
        assert_eq!(cfg.events_url, "http://127.0.0.1:8080/api/events");
        assert_eq!(cfg.retry_policy().max_retries(), 3);
    }

    #[test]
    fn overrides_and_derived_events_url() {
        let cfg = SyncConfig::from_lookup(lookup(&[
            ("POSTDECK_API_URL", "https://posts.example/api/"),
            ("POSTDECK_PAGE_SIZE", "25"),
            ("POSTDECK_RETRY_DELAYS_MS", "500, 1500"),
        ]))
        .unwrap();
        assert_eq!(cfg.api_url, "https://posts.example/api");
        assert_eq!(cfg.events_url, "https://posts.example/api/events");
        assert_eq!(cfg.page_size, 25);
        assert_eq!(cfg.retry_delays, vec![Duration::from_millis(500), Duration::from_millis(1500)]);
    }

    #[test]
    fn rejects_bad_values() {
        let err = SyncConfig::from_lookup(lookup(&[("POSTDECK_PAGE_SIZE", "lots")])).unwrap_err();
        assert_eq!(err, ConfigError::Invalid { key: "POSTDECK_PAGE_SIZE", value: "lots".into() });
        let err = SyncConfig::from_lookup(lookup(&[("POSTDECK_QUEUE_CAP", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { key: "POSTDECK_QUEUE_CAP" });
    }
}
