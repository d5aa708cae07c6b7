//! Structured per-request cache events.
//!
//! When enabled, every request handled by the page cache emits one JSON
//! event on the `tower_page_cache::events` tracing target, carrying the
//! outcome, the (optionally hashed) key and the reject reason.

use std::time::{Duration, SystemTime};

use http::{Method, StatusCode};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::telemetry::ProcessStatus;

/// Tracing target of cache events.
pub const EVENT_TARGET: &str = "tower_page_cache::events";

/// Configuration for structured cache event logging.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub enabled: bool,

    /// Sample rate (1.0 = all requests, 0.1 = 10%)
    pub sample_rate: f64,

    /// Hash cache keys before logging them.
    pub hash_keys: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 1.0,
            hash_keys: true,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the sample rate, clamped to `0.0..=1.0`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_hash_keys(mut self, hash: bool) -> Self {
        self.hash_keys = hash;
        self
    }

    pub fn should_sample(&self) -> bool {
        if !self.enabled || self.sample_rate <= 0.0 {
            return false;
        }
        if self.sample_rate >= 1.0 {
            return true;
        }
        use std::collections::hash_map::RandomState;
        use std::hash::BuildHasher;

        let random = (RandomState::new().hash_one(SystemTime::now()) as f64) / (u64::MAX as f64);
        random < self.sample_rate
    }
}

/// One handled request.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub timestamp: SystemTime,
    pub outcome: ProcessStatus,
    /// Page key of the served or stored variant; empty when no key was
    /// derived.
    pub key: String,
    pub method: Option<Method>,
    pub uri: Option<String>,
    pub status: Option<StatusCode>,
    pub size_bytes: Option<usize>,
    pub latency_us: Option<u64>,
    pub reason: Option<String>,
}

impl CacheEvent {
    pub fn new(outcome: ProcessStatus, key: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            outcome,
            key: key.into(),
            method: None,
            uri: None,
            status: None,
            size_bytes: None,
            latency_us: None,
            reason: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size_bytes = Some(size);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = Some(latency.as_micros().min(u64::MAX as u128) as u64);
        self
    }

    /// Records the reject reason; an empty reason is dropped.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.reason = (!reason.is_empty()).then_some(reason);
        self
    }

    /// Renders the event as the JSON object that [`CacheEvent::log`] emits.
    pub fn to_json(&self, config: &LoggingConfig) -> serde_json::Value {
        let key = if config.hash_keys && !self.key.is_empty() {
            hash_key(&self.key)
        } else {
            self.key.clone()
        };

        json!({
            "timestamp": chrono::DateTime::<chrono::Utc>::from(self.timestamp)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            "outcome": self.outcome.as_str(),
            "hit": self.outcome == ProcessStatus::Hit,
            "key": key,
            "method": self.method.as_ref().map(Method::as_str),
            "uri": self.uri,
            "status": self.status.map(|s| s.as_u16()),
            "size_bytes": self.size_bytes,
            "latency_us": self.latency_us,
            "reason": self.reason,
        })
    }

    pub fn log(&self, config: &LoggingConfig) {
        if !config.should_sample() {
            return;
        }
        let event = self.to_json(config);
        tracing::info!(target: EVENT_TARGET, event = %event);
    }
}

/// SHA-256 of a cache key, hex encoded.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_is_off_by_default() {
        let config = LoggingConfig::default();
        assert!(!config.enabled);
        assert!(config.hash_keys);
        assert!(!config.should_sample());
    }

    #[test]
    fn sample_rate_clamped() {
        assert_eq!(LoggingConfig::new().with_sample_rate(1.5).sample_rate, 1.0);
        assert_eq!(LoggingConfig::new().with_sample_rate(-0.5).sample_rate, 0.0);
        assert!(!LoggingConfig::new()
            .with_enabled(true)
            .with_sample_rate(0.0)
            .should_sample());
        assert!(LoggingConfig::new().with_enabled(true).should_sample());
    }

    #[test]
    fn event_json_hashes_key_and_drops_empty_reason() {
        let event = CacheEvent::new(ProcessStatus::Hit, "example.com/_index_slash.html")
            .with_method(Method::GET)
            .with_uri("/")
            .with_status(StatusCode::OK)
            .with_size(512)
            .with_latency(Duration::from_micros(150))
            .with_reason("");

        let hashed = event.to_json(&LoggingConfig::new());
        assert_eq!(hashed["key"], hash_key("example.com/_index_slash.html"));
        assert_eq!(hashed["outcome"], "hit");
        assert_eq!(hashed["hit"], true);
        assert_eq!(hashed["latency_us"], 150);
        assert!(hashed["reason"].is_null());

        let plain = event.to_json(&LoggingConfig::new().with_hash_keys(false));
        assert_eq!(plain["key"], "example.com/_index_slash.html");
    }

    #[test]
    fn miss_event_carries_reason() {
        let event = CacheEvent::new(ProcessStatus::MissLoggedIn, "").with_reason("User is logged in");
        let json = event.to_json(&LoggingConfig::new());
        assert_eq!(json["outcome"], "miss_logged_in");
        assert_eq!(json["reason"], "User is logged in");
        assert_eq!(json["key"], "");
    }

    #[test]
    fn hash_key_is_stable() {
        assert_eq!(hash_key("/a"), hash_key("/a"));
        assert_eq!(hash_key("/a").len(), 64);
    }
}
