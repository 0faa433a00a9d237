// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataStorm Configuration - Single Source of Truth
//!
//! This module centralizes the protocol constants, the property names and
//! the runtime configuration store.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time defaults and servant identities
//! - **Level 2 (Dynamic)**: [`RuntimeConfig`], a property store loaded from
//!   code or from a `key = value` file, plus a hot-swappable [`RetryPolicy`]
//!
//! # Example
//!
//! ```ignore
//! use datastorm::config::*;
//!
//! let config = RuntimeConfig::new();
//! config.set(props::TOPIC_SAMPLE_COUNT, "10");
//! config.set(props::NODE_RETRY_DELAY, "250");
//!
//! let defaults = config.reader_defaults()?;
//! let delay = config.retry_policy().delay(3);
//! ```

use crate::api::{Error, Result};
use crate::protocol::{ClearHistoryPolicy, DiscardPolicy, ElementConfig};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// =======================================================================
// Session retry defaults
// =======================================================================

/// Base delay before a session reconnection attempt (milliseconds).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Growth factor of the reconnection delay.
pub const DEFAULT_RETRY_MULTIPLIER: u32 = 2;

/// Reconnection attempts before a session is removed.
pub const DEFAULT_RETRY_COUNT: u32 = 6;

// =======================================================================
// Element defaults
// =======================================================================

/// Unbounded history.
pub const DEFAULT_SAMPLE_COUNT: i32 = -1;

/// Samples never expire.
pub const DEFAULT_SAMPLE_LIFETIME_MS: i32 = 0;

pub const DEFAULT_CLEAR_HISTORY: ClearHistoryPolicy = ClearHistoryPolicy::OnAll;

pub const DEFAULT_DISCARD_POLICY: DiscardPolicy = DiscardPolicy::None;

pub const DEFAULT_PRIORITY: i32 = 0;

// =======================================================================
// Servant identities
// =======================================================================

/// Category of node servants (session handshake and session facets).
pub const NODE_CATEGORY: &str = "node";

/// Category of the relay forwarder.
pub const FORWARDER_CATEGORY: &str = "forward";

/// Well-known lookup servant, reachable without knowing the node name.
pub const LOOKUP_CATEGORY: &str = "DataStorm";
pub const LOOKUP_NAME: &str = "Lookup";

/// Facet prefixes of session servants.
pub const PUBLISHER_FACET: &str = "p";
pub const SUBSCRIBER_FACET: &str = "s";

/// Id of the always-match key filter.
pub const ALWAYS_MATCH_FILTER_ID: i64 = 1;

/// Built-in key and sample filter names.
pub const REGEX_FILTER: &str = "_regex";
pub const EVENT_FILTER: &str = "_event";

/// Property names understood by [`RuntimeConfig`].
pub mod props {
    // === Topic element defaults ===
    pub const TOPIC_SAMPLE_COUNT: &str = "DataStorm.Topic.SampleCount";
    pub const TOPIC_SAMPLE_LIFETIME: &str = "DataStorm.Topic.SampleLifetime";
    pub const TOPIC_CLEAR_HISTORY: &str = "DataStorm.Topic.ClearHistory";
    pub const TOPIC_DISCARD_POLICY: &str = "DataStorm.Topic.DiscardPolicy";
    pub const TOPIC_PRIORITY: &str = "DataStorm.Topic.Priority";

    // === Node ===
    pub const NODE_NAME: &str = "DataStorm.Node.Name";
    pub const NODE_RETRY_DELAY: &str = "DataStorm.Node.RetryDelay";
    pub const NODE_RETRY_MULTIPLIER: &str = "DataStorm.Node.RetryMultiplier";
    pub const NODE_RETRY_COUNT: &str = "DataStorm.Node.RetryCount";
    pub const NODE_MULTICAST_ENABLED: &str = "DataStorm.Node.Multicast.Enabled";
    pub const NODE_SERVER_ENDPOINT: &str = "DataStorm.Node.Server.Endpoint";
    pub const NODE_CONNECT_TO: &str = "DataStorm.Node.ConnectTo";
}

/// Session reconnection schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_delay: Duration,
    pub multiplier: u32,
    pub retry_count: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based):
    /// `retry_delay * multiplier^min(attempt, retry_count)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.retry_count);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.retry_delay.saturating_mul(factor)
    }
}

/// Runtime configuration (thread-safe, lock-free reads)
///
/// Cloning shares the underlying store.
#[derive(Clone)]
pub struct RuntimeConfig {
    properties: Arc<DashMap<Arc<str>, Arc<str>>>,
    retry: Arc<ArcSwap<RetryPolicy>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("properties", &self.properties.len())
            .field("retry", &**self.retry.load())
            .finish()
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            properties: Arc::new(DashMap::new()),
            retry: Arc::new(ArcSwap::from_pointee(RetryPolicy::default())),
        }
    }

    // ===================================================================
    // Properties
    // ===================================================================

    /// Set a property. Node retry properties also refresh the retry policy.
    pub fn set(&self, key: &str, value: &str) {
        self.properties.insert(Arc::from(key), Arc::from(value.trim()));
        if key.starts_with("DataStorm.Node.Retry") {
            if let Err(e) = self.refresh_retry_policy() {
                log::warn!("[config] ignoring invalid retry property {}: {}", key, e);
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.properties.get(key).map(|v| Arc::clone(&v))
    }

    pub fn remove(&self, key: &str) -> Option<Arc<str>> {
        self.properties.remove(key).map(|(_, v)| v)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// All properties starting with `prefix`.
    #[must_use]
    pub fn search_prefix(&self, prefix: &str) -> Vec<(Arc<str>, Arc<str>)> {
        self.properties
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (Arc::clone(entry.key()), Arc::clone(entry.value())))
            .collect()
    }

    /// Parse an integer property, `None` when unset.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            Some(value) => value
                .parse::<i64>()
                .map(Some)
                .map_err(|_| Error::Config(format!("{} = `{}` is not an integer", key, value))),
            None => Ok(None),
        }
    }

    /// Parse a boolean property (`1`/`0`, `true`/`false`), `None` when unset.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key).as_deref() {
            Some("1") | Some("true") => Ok(Some(true)),
            Some("0") | Some("false") => Ok(Some(false)),
            Some(other) => Err(Error::Config(format!("{} = `{}` is not a boolean", key, other))),
            None => Ok(None),
        }
    }

    /// Load `key = value` lines from a property file. Blank lines and lines
    /// starting with `#` are ignored.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ConfigFileNotFound(path.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::Config(format!(
                    "{}:{}: expected `key = value`",
                    path.display(),
                    lineno + 1
                )));
            };
            self.set(key.trim(), value.trim());
        }
        log::debug!("[config] loaded {} ({} properties)", path.display(), self.len());
        Ok(())
    }

    // ===================================================================
    // Retry policy (atomic swap)
    // ===================================================================

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        **self.retry.load()
    }

    pub fn set_retry_policy(&self, policy: RetryPolicy) {
        self.retry.store(Arc::new(policy));
    }

    fn refresh_retry_policy(&self) -> Result<()> {
        let mut policy = RetryPolicy::default();
        if let Some(delay) = self.get_int(props::NODE_RETRY_DELAY)? {
            policy.retry_delay = Duration::from_millis(non_negative(props::NODE_RETRY_DELAY, delay)?);
        }
        if let Some(multiplier) = self.get_int(props::NODE_RETRY_MULTIPLIER)? {
            policy.multiplier = bounded(props::NODE_RETRY_MULTIPLIER, multiplier)?;
        }
        if let Some(count) = self.get_int(props::NODE_RETRY_COUNT)? {
            policy.retry_count = bounded(props::NODE_RETRY_COUNT, count)?;
        }
        self.set_retry_policy(policy);
        Ok(())
    }

    // ===================================================================
    // Element defaults
    // ===================================================================

    /// Fully resolved defaults for reader elements.
    pub fn reader_defaults(&self) -> Result<ElementConfig> {
        let mut config = self.element_defaults()?;
        config.discard_policy = Some(match self.get(props::TOPIC_DISCARD_POLICY) {
            Some(value) => DiscardPolicy::parse(&value).ok_or_else(|| {
                Error::Config(format!("{} = `{}`", props::TOPIC_DISCARD_POLICY, value))
            })?,
            None => DEFAULT_DISCARD_POLICY,
        });
        Ok(config)
    }

    /// Fully resolved defaults for writer elements.
    pub fn writer_defaults(&self) -> Result<ElementConfig> {
        let mut config = self.element_defaults()?;
        config.priority = Some(match self.get_int(props::TOPIC_PRIORITY)? {
            Some(p) => bounded(props::TOPIC_PRIORITY, p)?,
            None => DEFAULT_PRIORITY,
        });
        Ok(config)
    }

    fn element_defaults(&self) -> Result<ElementConfig> {
        let clear_history = match self.get(props::TOPIC_CLEAR_HISTORY) {
            Some(value) => ClearHistoryPolicy::parse(&value).ok_or_else(|| {
                Error::Config(format!("{} = `{}`", props::TOPIC_CLEAR_HISTORY, value))
            })?,
            None => DEFAULT_CLEAR_HISTORY,
        };
        let sample_count = match self.get_int(props::TOPIC_SAMPLE_COUNT)? {
            Some(c) => bounded(props::TOPIC_SAMPLE_COUNT, c)?,
            None => DEFAULT_SAMPLE_COUNT,
        };
        let sample_lifetime = match self.get_int(props::TOPIC_SAMPLE_LIFETIME)? {
            Some(l) => bounded(props::TOPIC_SAMPLE_LIFETIME, l)?,
            None => DEFAULT_SAMPLE_LIFETIME_MS,
        };
        Ok(ElementConfig {
            sample_count: Some(sample_count),
            sample_lifetime: Some(sample_lifetime),
            clear_history: Some(clear_history),
            ..Default::default()
        })
    }
}

fn non_negative(key: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Config(format!("{} must not be negative", key)))
}

/// Narrow a parsed property to the field's type, rejecting values that would wrap.
fn bounded<T: TryFrom<i64>>(key: &str, value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| Error::Config(format!("{} = {} is out of range", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_retry_delay_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_millis(1000));
        assert_eq!(policy.delay(3), Duration::from_millis(4000));
        // Capped at retry_count
        assert_eq!(policy.delay(6), policy.delay(60));
        assert_eq!(policy.delay(6), Duration::from_millis(500 * 64));
    }

    #[test]
    fn test_retry_properties_refresh_policy() {
        let config = RuntimeConfig::new();
        config.set(props::NODE_RETRY_DELAY, "10");
        config.set(props::NODE_RETRY_MULTIPLIER, "3");
        config.set(props::NODE_RETRY_COUNT, "2");

        let policy = config.retry_policy();
        assert_eq!(policy.retry_delay, Duration::from_millis(10));
        assert_eq!(policy.multiplier, 3);
        assert_eq!(policy.retry_count, 2);
        assert_eq!(policy.delay(5), Duration::from_millis(90));
    }

    #[test]
    fn test_invalid_retry_property_keeps_policy() {
        let config = RuntimeConfig::new();
        config.set(props::NODE_RETRY_DELAY, "soon");
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_element_defaults() {
        let config = RuntimeConfig::new();
        let reader = config.reader_defaults().expect("reader defaults");
        assert_eq!(reader.sample_count, Some(DEFAULT_SAMPLE_COUNT));
        assert_eq!(reader.sample_lifetime, Some(0));
        assert_eq!(reader.clear_history, Some(ClearHistoryPolicy::OnAll));
        assert_eq!(reader.discard_policy, Some(DiscardPolicy::None));
        assert_eq!(reader.priority, None);

        config.set(props::TOPIC_PRIORITY, "7");
        config.set(props::TOPIC_CLEAR_HISTORY, "Never");
        let writer = config.writer_defaults().expect("writer defaults");
        assert_eq!(writer.priority, Some(7));
        assert_eq!(writer.clear_history, Some(ClearHistoryPolicy::Never));
        assert_eq!(writer.discard_policy, None);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let config = RuntimeConfig::new();
        config.set(props::TOPIC_DISCARD_POLICY, "Sometimes");
        assert!(matches!(config.reader_defaults(), Err(Error::Config(_))));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let config = RuntimeConfig::new();
        config.set(props::TOPIC_SAMPLE_COUNT, "4294967296");
        assert!(matches!(config.reader_defaults(), Err(Error::Config(_))));

        let config = RuntimeConfig::new();
        config.set(props::TOPIC_SAMPLE_LIFETIME, "-2147483649");
        assert!(matches!(config.writer_defaults(), Err(Error::Config(_))));

        let config = RuntimeConfig::new();
        config.set(props::TOPIC_PRIORITY, "2147483648");
        assert!(matches!(config.writer_defaults(), Err(Error::Config(_))));

        // A retry count that would wrap leaves the previous policy in place.
        let config = RuntimeConfig::new();
        config.set(props::NODE_RETRY_COUNT, "3");
        config.set(props::NODE_RETRY_COUNT, "4294967299");
        assert_eq!(config.retry_policy().retry_count, 3);
        assert!(matches!(config.refresh_retry_policy(), Err(Error::Config(_))));
        config.set(props::NODE_RETRY_MULTIPLIER, "-1");
        assert_eq!(config.retry_policy().retry_count, 3);
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "# node settings").expect("write");
        writeln!(file, "DataStorm.Node.Name = alpha").expect("write");
        writeln!(file).expect("write");
        writeln!(file, "DataStorm.Topic.SampleCount=5").expect("write");
        writeln!(file, "DataStorm.Node.RetryCount = 1").expect("write");

        let config = RuntimeConfig::new();
        config.load_file(file.path()).expect("load");

        assert_eq!(config.get(props::NODE_NAME).as_deref(), Some("alpha"));
        assert_eq!(config.get_int(props::TOPIC_SAMPLE_COUNT).expect("int"), Some(5));
        assert_eq!(config.retry_policy().retry_count, 1);
        assert_eq!(config.search_prefix("DataStorm.Node.").len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let config = RuntimeConfig::new();
        let err = config
            .load_file("/nonexistent/datastorm.conf")
            .expect_err("missing file");
        assert!(matches!(err, Error::ConfigFileNotFound(_)));
    }

    #[test]
    fn test_load_malformed_line() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "not a property").expect("write");
        let config = RuntimeConfig::new();
        assert!(matches!(config.load_file(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_bool_property() {
        let config = RuntimeConfig::new();
        assert_eq!(config.get_bool(props::NODE_MULTICAST_ENABLED).expect("unset"), None);
        config.set(props::NODE_MULTICAST_ENABLED, "1");
        assert_eq!(config.get_bool(props::NODE_MULTICAST_ENABLED).expect("set"), Some(true));
        config.set(props::NODE_MULTICAST_ENABLED, "maybe");
        assert!(config.get_bool(props::NODE_MULTICAST_ENABLED).is_err());
    }
}
