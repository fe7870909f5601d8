//! Client configuration.

use std::time::Duration;

/// Environment variable for the relay URL.
pub const WEBSOCKET_URL_ENV: &str = "CODEROOM_WEBSOCKET_URL";
/// Environment variable for the execution/problem API base URL.
pub const API_BASE_URL_ENV: &str = "CODEROOM_API_BASE_URL";

pub const DEFAULT_WEBSOCKET_URL: &str = "ws://localhost:1234";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Settings for a collaborating client.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Relay WebSocket URL
    pub websocket_url: String,
    /// Execution and problem API base URL
    pub api_base_url: String,
    /// Reconnect after a dropped connection
    pub auto_reconnect: bool,
    /// Fixed wait between reconnect attempts
    pub reconnect_delay: Duration,
    /// Transport events buffered before the connection task waits
    pub event_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// Defaults, overridden by `CODEROOM_WEBSOCKET_URL` and `CODEROOM_API_BASE_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = lookup(WEBSOCKET_URL_ENV).filter(|v| !v.is_empty()) {
            config.websocket_url = url;
        }
        if let Some(url) = lookup(API_BASE_URL_ENV).filter(|v| !v.is_empty()) {
            config.api_base_url = url;
        }
        config
    }

    pub fn with_websocket_url(mut self, url: impl Into<String>) -> Self {
        self.websocket_url = url.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.websocket_url, "ws://localhost:1234");
        assert_eq!(config.api_base_url, "http://localhost:8080/api");
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert!(config.auto_reconnect);
        assert_eq!(config.event_capacity, 256);
    }

    #[test]
    fn test_lookup_overrides() {
        let config = CollabConfig::from_lookup(|key| match key {
            WEBSOCKET_URL_ENV => Some("ws://relay:9000".to_string()),
            API_BASE_URL_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.websocket_url, "ws://relay:9000");
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }
}
