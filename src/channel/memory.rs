//! In-memory channel store.
//!
//! Backs the demo binary and the tests. Besides the [`ChannelStore`] contract it
//! records every write call and can inject read failures, write failures and
//! write latency.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use super::{same_listener, ChannelId, ChannelStore, ValueListener};
use crate::domain::{Clock, Timestamp, Value};
use crate::error::{ChannelError, InvalidValueError, Severity};

/// One `write` call as seen by the store
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub channel: ChannelId,
    pub values: Vec<Value>,
}

#[derive(Default)]
struct ChannelSlot {
    history: Vec<Value>,
    /// Future-dated values, ascending by timestamp
    pending: Vec<Value>,
    invalid: Option<(Severity, String)>,
}

#[derive(Default)]
struct Faults {
    write_delay: Option<Duration>,
    fail_writes: bool,
    read_only: HashSet<ChannelId>,
}

pub struct MemoryChannelStore {
    clock: Arc<dyn Clock>,
    slots: RwLock<HashMap<ChannelId, ChannelSlot>>,
    listeners: RwLock<HashMap<ChannelId, Vec<Arc<dyn ValueListener>>>>,
    write_log: Mutex<Vec<WriteRecord>>,
    faults: Mutex<Faults>,
}

impl MemoryChannelStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            slots: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            write_log: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Make a value current immediately, as device feedback would
    pub fn set_value(&self, channel: &ChannelId, value: Value) {
        self.slots
            .write()
            .entry(channel.clone())
            .or_default()
            .history
            .push(value.clone());
        self.notify(channel, &[value]);
    }

    /// Release queued values whose timestamp has been reached; returns how many
    pub fn release_due(&self) -> usize {
        let now = self.clock.now();
        let mut released: Vec<(ChannelId, Vec<Value>)> = Vec::new();
        {
            let mut slots = self.slots.write();
            for (channel, slot) in slots.iter_mut() {
                let split = slot.pending.partition_point(|v| v.timestamp <= now);
                if split == 0 {
                    continue;
                }
                let due: Vec<Value> = slot.pending.drain(..split).collect();
                slot.history.extend(due.iter().cloned());
                released.push((channel.clone(), due));
            }
        }
        let count = released.iter().map(|(_, v)| v.len()).sum();
        for (channel, values) in released {
            self.notify(&channel, &values);
        }
        count
    }

    /// Inject (or clear) a read failure for a channel
    pub fn set_invalid(&self, channel: &ChannelId, invalid: Option<(Severity, String)>) {
        self.slots.write().entry(channel.clone()).or_default().invalid = invalid;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.faults.lock().fail_writes = fail;
    }

    /// Reject writes to one channel with `NotWritable`
    pub fn set_writable(&self, channel: &ChannelId, writable: bool) {
        let mut faults = self.faults.lock();
        if writable {
            faults.read_only.remove(channel);
        } else {
            faults.read_only.insert(channel.clone());
        }
    }

    pub fn set_write_delay(&self, delay: Option<Duration>) {
        self.faults.lock().write_delay = delay;
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.write_log.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.write_log.lock().clear();
    }

    /// Values that became current on a channel, oldest first
    pub fn history(&self, channel: &ChannelId) -> Vec<Value> {
        self.slots
            .read()
            .get(channel)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub fn pending(&self, channel: &ChannelId) -> Vec<Value> {
        self.slots
            .read()
            .get(channel)
            .map(|s| s.pending.clone())
            .unwrap_or_default()
    }

    pub fn listener_count(&self, channel: &ChannelId) -> usize {
        self.listeners.read().get(channel).map_or(0, Vec::len)
    }

    fn notify(&self, channel: &ChannelId, values: &[Value]) {
        // snapshot so listeners may (de)register while being called
        let listeners = self
            .listeners
            .read()
            .get(channel)
            .cloned()
            .unwrap_or_default();
        for value in values {
            for listener in &listeners {
                listener.on_value(channel, value);
            }
        }
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    fn latest_value(&self, channel: &ChannelId) -> Result<Value, InvalidValueError> {
        let slots = self.slots.read();
        let Some(slot) = slots.get(channel) else {
            return Ok(Value::empty(Timestamp::default()));
        };
        if let Some((severity, reason)) = &slot.invalid {
            return Err(InvalidValueError::new(channel.clone(), *severity, reason.clone()));
        }
        Ok(slot
            .history
            .last()
            .cloned()
            .unwrap_or_else(|| Value::empty(Timestamp::default())))
    }

    async fn write(&self, channel: &ChannelId, values: Vec<Value>) -> Result<(), ChannelError> {
        let (delay, fail, read_only) = {
            let faults = self.faults.lock();
            (faults.write_delay, faults.fail_writes, faults.read_only.contains(channel))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ChannelError::WriteFailed {
                channel: channel.clone(),
                reason: "simulated write failure".into(),
            });
        }
        if read_only {
            return Err(ChannelError::NotWritable(channel.clone()));
        }

        trace!(channel = %channel, count = values.len(), "write");
        self.write_log.lock().push(WriteRecord {
            channel: channel.clone(),
            values: values.clone(),
        });

        let now = self.clock.now();
        let (due, queued): (Vec<Value>, Vec<Value>) =
            values.into_iter().partition(|v| v.timestamp <= now);
        {
            let mut slots = self.slots.write();
            let slot = slots.entry(channel.clone()).or_default();
            slot.history.extend(due.iter().cloned());
            if let Some(first) = queued.first() {
                // a new future plan supersedes what was queued from its start on
                let cutoff = first.timestamp;
                slot.pending.retain(|v| v.timestamp < cutoff);
                slot.pending.extend(queued);
                slot.pending.sort_by_key(|v| v.timestamp);
            }
        }
        self.notify(channel, &due);
        Ok(())
    }

    fn register_listener(&self, channel: &ChannelId, listener: Arc<dyn ValueListener>) {
        let mut listeners = self.listeners.write();
        let entry = listeners.entry(channel.clone()).or_default();
        if !entry.iter().any(|l| same_listener(l, &listener)) {
            entry.push(listener);
        }
    }

    fn deregister_listener(&self, channel: &ChannelId, listener: &Arc<dyn ValueListener>) {
        if let Some(entry) = self.listeners.write().get_mut(channel) {
            entry.retain(|l| !same_listener(l, listener));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl ValueListener for Counter {
        fn on_value(&self, _channel: &ChannelId, _value: &Value) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn store() -> (Arc<ManualClock>, MemoryChannelStore) {
        let clock = Arc::new(ManualClock::new(Timestamp(1_000)));
        let store = MemoryChannelStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_future_values_are_queued() {
        let (clock, store) = store();
        let ch = ChannelId::from("setpoint");
        store
            .write(
                &ch,
                vec![
                    Value::double(Timestamp(1_000), 1.0),
                    Value::double(Timestamp(2_000), 2.0),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.latest_value(&ch).unwrap().as_f64(), Some(1.0));
        assert_eq!(store.pending(&ch).len(), 1);

        clock.set(Timestamp(2_000));
        assert_eq!(store.release_due(), 1);
        assert_eq!(store.latest_value(&ch).unwrap().as_f64(), Some(2.0));
        assert!(store.pending(&ch).is_empty());
    }

    #[tokio::test]
    async fn test_newer_plan_supersedes_queue() {
        let (_clock, store) = store();
        let ch = ChannelId::from("setpoint");
        store
            .write(
                &ch,
                vec![
                    Value::double(Timestamp(5_000), 1.0),
                    Value::double(Timestamp(9_000), 0.0),
                ],
            )
            .await
            .unwrap();
        store
            .write(&ch, vec![Value::double(Timestamp(7_000), 3.0)])
            .await
            .unwrap();

        let pending: Vec<i64> = store.pending(&ch).iter().map(|v| v.timestamp.0).collect();
        assert_eq!(pending, vec![5_000, 7_000]);
    }

    #[tokio::test]
    async fn test_listener_registered_once() {
        let (_clock, store) = store();
        let ch = ChannelId::from("state");
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let listener: Arc<dyn ValueListener> = counter.clone();

        store.register_listener(&ch, listener.clone());
        store.register_listener(&ch, listener.clone());
        assert_eq!(store.listener_count(&ch), 1);

        store.set_value(&ch, Value::bool(Timestamp(1_000), true));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        store.deregister_listener(&ch, &listener);
        store.set_value(&ch, Value::bool(Timestamp(1_000), false));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_logged() {
        let (_clock, store) = store();
        let ch = ChannelId::from("x");
        store.fail_writes(true);
        assert!(store
            .write(&ch, vec![Value::bool(Timestamp(0), true)])
            .await
            .is_err());
        assert!(store.writes().is_empty());
        assert!(store.latest_value(&ch).unwrap().is_empty());
    }
}
