//! Server configuration.

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use weft_core::flow::node::{DEFAULT_CODELET_RETRIES, DEFAULT_CODELET_TIMEOUT};
use weft_core::matching::MatcherKind;

/// Tunables for a [`ServerProcessor`](crate::processor::ServerProcessor).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the orchestrator announces to workers. Loopback workers
    /// have their stream addresses rewritten to this host.
    pub host: IpAddr,
    /// How long a worker may sit on a RESOURCE or PREPARE
    /// acknowledgement before it is treated as failed.
    pub client_timeout: Duration,
    /// Execution time limit stamped on nodes that do not override it.
    pub codelet_timeout: Duration,
    /// Retry budget stamped on nodes that do not override it.
    pub codelet_retries: u32,
    /// Which bipartite matching algorithm assigns workers.
    pub matcher: MatcherKind,
    /// Whether surplus idle workers are shut down after each refresh.
    pub auto_close: bool,
    /// Queue depth of each lifecycle-event subscriber; a full
    /// subscriber drops events rather than stalling the orchestrator.
    pub event_backlog: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_timeout: Duration::from_secs(60),
            codelet_timeout: DEFAULT_CODELET_TIMEOUT,
            codelet_retries: DEFAULT_CODELET_RETRIES,
            matcher: MatcherKind::default(),
            auto_close: false,
            event_backlog: 64,
        }
    }
}

impl ServerConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WEFT_HOST`: announced orchestrator address
    /// - `WEFT_CLIENT_TIMEOUT_MS`: acknowledgement deadline
    /// - `WEFT_CODELET_TIMEOUT_MS`: default execution time limit
    /// - `WEFT_CODELET_RETRIES`: default retry budget
    /// - `WEFT_MATCHER`: "hungarian" or "maxflow"
    /// - `WEFT_AUTO_CLOSE_IDLE`: "true" to shut down surplus workers
    /// - `WEFT_EVENT_BACKLOG`: per-subscriber event queue depth
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: parse_env("WEFT_HOST").unwrap_or(defaults.host),
            client_timeout: parse_env("WEFT_CLIENT_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.client_timeout),
            codelet_timeout: parse_env("WEFT_CODELET_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.codelet_timeout),
            codelet_retries: parse_env("WEFT_CODELET_RETRIES").unwrap_or(defaults.codelet_retries),
            matcher: parse_env("WEFT_MATCHER").unwrap_or(defaults.matcher),
            auto_close: parse_env("WEFT_AUTO_CLOSE_IDLE").unwrap_or(defaults.auto_close),
            event_backlog: parse_env("WEFT_EVENT_BACKLOG").unwrap_or(defaults.event_backlog),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = ServerConfig::default();
        assert_eq!(config.client_timeout, Duration::from_secs(60));
        assert_eq!(config.codelet_timeout, Duration::from_millis(86_400_000));
        assert_eq!(config.codelet_retries, 8);
        assert_eq!(config.matcher, MatcherKind::Hungarian);
        assert!(!config.auto_close);
    }
}
