use thiserror::Error;
use tracing::trace;

use crate::channel::{ChannelId, ChannelStore};
use crate::domain::{Timestamp, Value};
use crate::error::ChannelError;

/// Emission stopped at a failing channel; the channels before it were written
#[derive(Debug, Error)]
#[error("{source} ({written} of {total} channels written)")]
pub struct EmitError {
    pub written: usize,
    pub total: usize,
    #[source]
    pub source: ChannelError,
}

impl EmitError {
    pub fn is_partial(&self) -> bool {
        self.written > 0
    }
}

/// Ordered, per-channel accumulation of writes for one logical operation.
///
/// Channels keep the order in which they were first touched; values keep the
/// order in which they were pushed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    channels: Vec<(ChannelId, Vec<Value>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, channel: &ChannelId, value: Value) {
        match self.channels.iter_mut().find(|(c, _)| c == channel) {
            Some((_, values)) => values.push(value),
            None => self.channels.push((channel.clone(), vec![value])),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Total number of values across all channels
    pub fn len(&self) -> usize {
        self.channels.iter().map(|(_, v)| v.len()).sum()
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelId> {
        self.channels.iter().map(|(c, _)| c)
    }

    pub fn values(&self, channel: &ChannelId) -> Option<&[Value]> {
        self.channels
            .iter()
            .find(|(c, _)| c == channel)
            .map(|(_, v)| v.as_slice())
    }

    /// Timestamp of the latest value in the batch
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.channels
            .iter()
            .flat_map(|(_, v)| v.iter())
            .map(|v| v.timestamp)
            .max()
    }

    /// One `write` call per channel, in insertion order. Stops at the first failure.
    pub async fn emit(&self, store: &dyn ChannelStore) -> Result<(), EmitError> {
        for (written, (channel, values)) in self.channels.iter().enumerate() {
            trace!(channel = %channel, count = values.len(), "emitting");
            store
                .write(channel, values.clone())
                .await
                .map_err(|source| EmitError {
                    written,
                    total: self.channels.len(),
                    source,
                })?;
        }
        Ok(())
    }
}
