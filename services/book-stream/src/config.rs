//! Environment-based configuration.
//!
//! Every setting has a default, so the service starts with no environment
//! at all. Variables:
//!
//! | variable                         | default                           |
//! |----------------------------------|-----------------------------------|
//! | `BOOK_STREAM_BIND`               | `0.0.0.0:9002`                    |
//! | `BOOK_STREAM_INSTRUMENTS`        | `BTC-PERPETUAL`                   |
//! | `BOOK_STREAM_VENUE_URL`          | `https://test.deribit.com/api/v2` |
//! | `BOOK_STREAM_POLL_MS`            | `1000`                            |
//! | `BOOK_STREAM_QUEUE_CAPACITY`     | `256`                             |
//! | `BOOK_STREAM_DROP_POLICY`        | `disconnect`                      |
//! | `BOOK_STREAM_MAX_SUBSCRIPTIONS`  | `50`                              |
//! | `BOOK_STREAM_HEARTBEAT_SECS`     | `30`                              |
//! | `BOOK_STREAM_STALE_SECS`         | `90`                              |
//!
//! An empty `BOOK_STREAM_VENUE_URL` disables the built-in poller.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use types::instrument::InstrumentName;

use crate::outbox::DropPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Per-connection settings for the WebSocket server.
#[derive(Debug, Clone, PartialEq)]
pub struct WsConfig {
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close a connection that has sent nothing (not even a pong) for this long.
    pub stale_timeout: Duration,
    /// Max inbound messages per client per rate limit window.
    pub rate_limit_max_messages: u32,
    /// Rate limit window duration.
    pub rate_limit_window: Duration,
    /// Max subscriptions per client.
    pub max_subscriptions_per_connection: usize,
    /// Outbound queue capacity per client.
    pub queue_capacity: usize,
    /// What to do when a client's outbound queue is full.
    pub drop_policy: DropPolicy,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(90),
            rate_limit_max_messages: 100,
            rate_limit_window: Duration::from_secs(1),
            max_subscriptions_per_connection: 50,
            queue_capacity: 256,
            drop_policy: DropPolicy::Disconnect,
        }
    }
}

/// Upstream polling settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// JSON-RPC base URL; `None` disables polling.
    pub venue_url: Option<String>,
    /// Instruments to poll. Also the ingestion allow-list.
    pub instruments: Vec<InstrumentName>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            venue_url: Some("https://test.deribit.com/api/v2".to_string()),
            instruments: vec![InstrumentName::new("BTC-PERPETUAL")
                .unwrap_or_else(|_| unreachable!("literal instrument name is valid"))],
            poll_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bind: SocketAddr,
    pub ws: WsConfig,
    pub feed: FeedConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9002)),
            ws: WsConfig::default(),
            feed: FeedConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(bind) = parsed(&lookup, "BOOK_STREAM_BIND")? {
            config.bind = bind;
        }

        if let Some(raw) = lookup("BOOK_STREAM_INSTRUMENTS") {
            config.feed.instruments = parse_instruments(&raw)?;
        }
        if let Some(url) = lookup("BOOK_STREAM_VENUE_URL") {
            let url = url.trim().trim_end_matches('/').to_string();
            config.feed.venue_url = if url.is_empty() { None } else { Some(url) };
        }
        if let Some(ms) = parsed::<u64, _>(&lookup, "BOOK_STREAM_POLL_MS")? {
            config.feed.poll_interval = Duration::from_millis(positive("BOOK_STREAM_POLL_MS", ms)?);
        }

        if let Some(capacity) = parsed::<usize, _>(&lookup, "BOOK_STREAM_QUEUE_CAPACITY")? {
            config.ws.queue_capacity = positive("BOOK_STREAM_QUEUE_CAPACITY", capacity as u64)? as usize;
        }
        if let Some(policy) = lookup("BOOK_STREAM_DROP_POLICY") {
            config.ws.drop_policy = DropPolicy::from_str(policy.trim()).map_err(|reason| {
                ConfigError::Invalid {
                    var: "BOOK_STREAM_DROP_POLICY",
                    value: policy.clone(),
                    reason,
                }
            })?;
        }
        if let Some(max) = parsed::<usize, _>(&lookup, "BOOK_STREAM_MAX_SUBSCRIPTIONS")? {
            config.ws.max_subscriptions_per_connection =
                positive("BOOK_STREAM_MAX_SUBSCRIPTIONS", max as u64)? as usize;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "BOOK_STREAM_HEARTBEAT_SECS")? {
            config.ws.heartbeat_interval =
                Duration::from_secs(positive("BOOK_STREAM_HEARTBEAT_SECS", secs)?);
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "BOOK_STREAM_STALE_SECS")? {
            config.ws.stale_timeout = Duration::from_secs(positive("BOOK_STREAM_STALE_SECS", secs)?);
        }

        Ok(config)
    }
}

fn parsed<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn positive(var: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_instruments(raw: &str) -> Result<Vec<InstrumentName>, ConfigError> {
    let mut instruments = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let name = InstrumentName::new(part).map_err(|e| ConfigError::Invalid {
            var: "BOOK_STREAM_INSTRUMENTS",
            value: raw.to_string(),
            reason: e.to_string(),
        })?;
        if !instruments.contains(&name) {
            instruments.push(name);
        }
    }
    Ok(instruments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServiceConfig, ConfigError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(|var| env.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.bind.port(), 9002);
        assert_eq!(config.feed.instruments[0].as_str(), "BTC-PERPETUAL");
        assert_eq!(config.ws.drop_policy, DropPolicy::Disconnect);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BOOK_STREAM_BIND", "127.0.0.1:7000"),
            ("BOOK_STREAM_INSTRUMENTS", "BTC-PERPETUAL, ETH-PERPETUAL,,BTC-PERPETUAL"),
            ("BOOK_STREAM_VENUE_URL", "http://localhost:8080/api/v2/"),
            ("BOOK_STREAM_POLL_MS", "250"),
            ("BOOK_STREAM_QUEUE_CAPACITY", "8"),
            ("BOOK_STREAM_DROP_POLICY", "drop_oldest"),
            ("BOOK_STREAM_MAX_SUBSCRIPTIONS", "3"),
            ("BOOK_STREAM_HEARTBEAT_SECS", "5"),
            ("BOOK_STREAM_STALE_SECS", "15"),
        ])
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:7000".parse().unwrap());
        let names: Vec<&str> = config.feed.instruments.iter().map(|i| i.as_str()).collect();
        assert_eq!(names, vec!["BTC-PERPETUAL", "ETH-PERPETUAL"]);
        assert_eq!(
            config.feed.venue_url.as_deref(),
            Some("http://localhost:8080/api/v2")
        );
        assert_eq!(config.feed.poll_interval, Duration::from_millis(250));
        assert_eq!(config.ws.queue_capacity, 8);
        assert_eq!(config.ws.drop_policy, DropPolicy::DropOldest);
        assert_eq!(config.ws.max_subscriptions_per_connection, 3);
        assert_eq!(config.ws.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.ws.stale_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_empty_venue_url_disables_polling() {
        let config = load(&[("BOOK_STREAM_VENUE_URL", "")]).unwrap();
        assert!(config.feed.venue_url.is_none());
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = load(&[("BOOK_STREAM_BIND", "not-an-address")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BOOK_STREAM_BIND", .. }));

        let err = load(&[("BOOK_STREAM_POLL_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("BOOK_STREAM_POLL_MS"));

        let err = load(&[("BOOK_STREAM_DROP_POLICY", "block")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "BOOK_STREAM_DROP_POLICY", .. }));
    }
}
