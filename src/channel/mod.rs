//! # Channel contract
//!
//! Boundary to the key-value time-series store that reads and writes device
//! values. The engine only depends on [`ChannelStore`]; [`memory`] provides an
//! in-process implementation for simulation and tests.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::domain::Value;
use crate::error::{ChannelError, InvalidValueError};

pub use memory::{MemoryChannelStore, WriteRecord};

/// Address of a device value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscriber to channel value changes.
///
/// Called synchronously on the thread that made the value current; must not block.
pub trait ValueListener: Send + Sync {
    fn on_value(&self, channel: &ChannelId, value: &Value);
}

/// Identity comparison for listener registrations
pub fn same_listener(a: &Arc<dyn ValueListener>, b: &Arc<dyn ValueListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Key-value time-series store with subscription
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Latest value; [`Value::empty`] if nothing was ever recorded
    fn latest_value(&self, channel: &ChannelId) -> Result<Value, InvalidValueError>;

    /// Ordered write. Future-dated values are queued and become current at their timestamp.
    async fn write(&self, channel: &ChannelId, values: Vec<Value>) -> Result<(), ChannelError>;

    /// At most one registration per (channel, listener) pair
    fn register_listener(&self, channel: &ChannelId, listener: Arc<dyn ValueListener>);

    fn deregister_listener(&self, channel: &ChannelId, listener: &Arc<dyn ValueListener>);
}

/// Read with fallback: INFO/WARNING failures yield `default`, ERROR propagates.
pub fn read_or_default(
    store: &dyn ChannelStore,
    channel: &ChannelId,
    default: Value,
) -> Result<Value, InvalidValueError> {
    match store.latest_value(channel) {
        Ok(v) => Ok(v),
        Err(e) if e.is_tolerable() => {
            debug!(channel = %channel, severity = %e.severity, reason = %e.reason, "using fallback value");
            Ok(default)
        }
        Err(e) => Err(e),
    }
}

/// Numeric read that treats the empty sentinel as missing data
pub fn read_f64(store: &dyn ChannelStore, channel: &ChannelId) -> Result<Option<f64>, InvalidValueError> {
    let value = store.latest_value(channel)?;
    if value.is_empty() {
        return Ok(None);
    }
    Ok(value.as_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ManualClock, Timestamp};
    use crate::error::Severity;

    #[test]
    fn test_read_or_default_policy() {
        let store = MemoryChannelStore::new(Arc::new(ManualClock::new(Timestamp(0))));
        let ch = ChannelId::from("temp");
        let fallback = Value::double(Timestamp(0), 42.0);

        store.set_invalid(&ch, Some((Severity::Warning, "stale".into())));
        let v = read_or_default(&store, &ch, fallback.clone()).unwrap();
        assert_eq!(v, fallback);

        store.set_invalid(&ch, Some((Severity::Error, "sensor gone".into())));
        let err = read_or_default(&store, &ch, fallback).unwrap_err();
        assert_eq!(err.severity, Severity::Error);
    }

    #[test]
    fn test_read_f64_empty_is_none() {
        let store = MemoryChannelStore::new(Arc::new(ManualClock::new(Timestamp(0))));
        let ch = ChannelId::from("power");
        assert_eq!(read_f64(&store, &ch).unwrap(), None);
        store.set_value(&ch, Value::double(Timestamp(0), 1.5));
        assert_eq!(read_f64(&store, &ch).unwrap(), Some(1.5));
    }
}
