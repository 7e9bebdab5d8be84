//! Pool, event and pull configuration.
//!
//! `PoolOptions` holds the pool-wide defaults and is immutable once the pool
//! is built. Each emitted record snapshots its effective [`EventOptions`],
//! which start from the pool defaults and may be overridden per event.
//!
//! `None` means unbounded for every limit and timeout.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};

/// Default maximum number of pending events per recipient.
pub const DEFAULT_MAX_PENDING_EVENTS: usize = 100;

/// Default time a pull waits for a record before timing out.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_MAX_PENDING_EVENTS: &str = "EVENT_POOL_MAX_PENDING_EVENTS";
const ENV_PENDING_TIMEOUT_MS: &str = "EVENT_POOL_PENDING_TIMEOUT_MS";
const ENV_HANDLING_TIMEOUT_MS: &str = "EVENT_POOL_HANDLING_TIMEOUT_MS";

/// Pool-wide defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOptions {
    /// Maximum length of a recipient's pending queue.
    pub max_pending_events: Option<usize>,
    /// How long a record may stay pending before its emitter times out.
    pub pending_timeout: Option<Duration>,
    /// How long a pulled record may stay unhandled before its emitter times out.
    pub handling_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_pending_events: Some(DEFAULT_MAX_PENDING_EVENTS),
            pending_timeout: None,
            handling_timeout: None,
        }
    }
}

impl PoolOptions {
    pub fn with_max_pending_events(mut self, limit: Option<usize>) -> Self {
        self.max_pending_events = limit;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn with_handling_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handling_timeout = timeout;
        self
    }

    /// Load options from environment variables.
    ///
    /// Reads a `.env` file first if one is present. Unset variables keep
    /// their defaults; `unbounded` or an empty value disables the limit.
    ///
    /// - `EVENT_POOL_MAX_PENDING_EVENTS`
    /// - `EVENT_POOL_PENDING_TIMEOUT_MS`
    /// - `EVENT_POOL_HANDLING_TIMEOUT_MS`
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let max_pending_events = match lookup(ENV_MAX_PENDING_EVENTS) {
            Some(raw) => parse_bound(&raw)
                .context("EVENT_POOL_MAX_PENDING_EVENTS must be a number or 'unbounded'")?,
            None => defaults.max_pending_events,
        };
        let pending_timeout = match lookup(ENV_PENDING_TIMEOUT_MS) {
            Some(raw) => parse_bound(&raw)
                .context("EVENT_POOL_PENDING_TIMEOUT_MS must be milliseconds or 'unbounded'")?
                .map(Duration::from_millis),
            None => defaults.pending_timeout,
        };
        let handling_timeout = match lookup(ENV_HANDLING_TIMEOUT_MS) {
            Some(raw) => parse_bound(&raw)
                .context("EVENT_POOL_HANDLING_TIMEOUT_MS must be milliseconds or 'unbounded'")?
                .map(Duration::from_millis),
            None => defaults.handling_timeout,
        };

        Ok(Self {
            max_pending_events,
            pending_timeout,
            handling_timeout,
        })
    }

    /// Effective options for an event emitted with these defaults.
    pub fn event_options(&self) -> EventOptions {
        EventOptions {
            max_pending_events: self.max_pending_events,
            pending_timeout: self.pending_timeout,
            handling_timeout: self.handling_timeout,
            wait_for_handlers: false,
        }
    }
}

fn parse_bound<T: std::str::FromStr>(raw: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unbounded") {
        return Ok(None);
    }
    Ok(Some(trimmed.parse::<T>()?))
}

/// Effective configuration snapshot of one event, captured at emit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOptions {
    pub max_pending_events: Option<usize>,
    pub pending_timeout: Option<Duration>,
    pub handling_timeout: Option<Duration>,
    /// Whether the emitter waits for "handled" rather than just "pulled".
    pub wait_for_handlers: bool,
}

impl EventOptions {
    pub fn with_max_pending_events(mut self, limit: Option<usize>) -> Self {
        self.max_pending_events = limit;
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pending_timeout = timeout;
        self
    }

    pub fn with_handling_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handling_timeout = timeout;
        self
    }

    pub fn with_wait_for_handlers(mut self, wait: bool) -> Self {
        self.wait_for_handlers = wait;
        self
    }
}

impl Default for EventOptions {
    fn default() -> Self {
        PoolOptions::default().event_options()
    }
}

/// Options for a single pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOptions {
    /// How long to wait for a record. `None` waits until one arrives.
    pub timeout: Option<Duration>,
    /// Track the pulled record until it settles even if its emitter
    /// is not waiting for handlers.
    pub wait_for_resolution: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_PULL_TIMEOUT),
            wait_for_resolution: false,
        }
    }
}

impl PullOptions {
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_wait_for_resolution(mut self, wait: bool) -> Self {
        self.wait_for_resolution = wait;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_pending_events, Some(100));
        assert_eq!(opts.pending_timeout, None);
        assert_eq!(opts.handling_timeout, None);

        let pull = PullOptions::default();
        assert_eq!(pull.timeout, Some(Duration::from_millis(30_000)));
        assert!(!pull.wait_for_resolution);
    }

    #[test]
    fn test_event_options_inherit_pool_defaults() {
        let pool = PoolOptions::default()
            .with_max_pending_events(Some(5))
            .with_pending_timeout(Some(Duration::from_secs(1)));
        let event = pool
            .event_options()
            .with_handling_timeout(Some(Duration::from_secs(2)))
            .with_wait_for_handlers(true);

        assert_eq!(event.max_pending_events, Some(5));
        assert_eq!(event.pending_timeout, Some(Duration::from_secs(1)));
        assert_eq!(event.handling_timeout, Some(Duration::from_secs(2)));
        assert!(event.wait_for_handlers);
    }

    #[test]
    fn test_from_lookup_empty_keeps_defaults() {
        let opts = PoolOptions::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(opts, PoolOptions::default());
    }

    #[test]
    fn test_from_lookup_parses_values() {
        let opts = PoolOptions::from_lookup(lookup_from(&[
            ("EVENT_POOL_MAX_PENDING_EVENTS", "unbounded"),
            ("EVENT_POOL_PENDING_TIMEOUT_MS", "1500"),
            ("EVENT_POOL_HANDLING_TIMEOUT_MS", " 20 "),
        ]))
        .unwrap();

        assert_eq!(opts.max_pending_events, None);
        assert_eq!(opts.pending_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(opts.handling_timeout, Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = PoolOptions::from_lookup(lookup_from(&[(
            "EVENT_POOL_MAX_PENDING_EVENTS",
            "lots",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("EVENT_POOL_MAX_PENDING_EVENTS"));
    }
}
