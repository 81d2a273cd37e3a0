//! # Timing guard
//!
//! Prevents chattering writes and enforces dwell times. The predicates are pure
//! functions of the recorded times; the times only move after a write was
//! actually emitted, so a rejected action leaves the guard untouched.

use serde::{Deserialize, Serialize};

use crate::domain::{RunState, Timestamp};

/// Guard limits; fixed once the component is activated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardConfig {
    pub min_runtime_ms: i64,
    pub min_idle_ms: i64,
    pub write_debounce_ms: i64,
}

/// Times of the last emitted write, start and stop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardTimes {
    pub last_write: Option<Timestamp>,
    pub last_start: Option<Timestamp>,
    pub last_stop: Option<Timestamp>,
}

#[derive(Debug, Clone)]
pub struct TimingGuard {
    config: GuardConfig,
    times: GuardTimes,
}

/// Milliseconds left until `since + limit` is reached at `t`; 0 when already reached
fn remaining(since: Option<Timestamp>, limit_ms: i64, t: Timestamp) -> i64 {
    match since {
        Some(since) => (limit_ms - t.millis_since(since)).max(0),
        None => 0,
    }
}

impl TimingGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            times: GuardTimes::default(),
        }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn times(&self) -> GuardTimes {
        self.times
    }

    /// Debounce gate applied to every write path
    pub fn is_ready(&self, t: Timestamp) -> bool {
        self.ready_in(t) == 0
    }

    pub fn ready_in(&self, t: Timestamp) -> i64 {
        remaining(self.times.last_write, self.config.write_debounce_ms, t)
    }

    /// Minimum idle time honoured (only constrains STANDBY/STOPPING)
    pub fn is_startable(&self, state: RunState, t: Timestamp) -> bool {
        self.startable_in(state, t) == 0
    }

    pub fn startable_in(&self, state: RunState, t: Timestamp) -> i64 {
        if !state.is_idle() {
            return 0;
        }
        remaining(self.times.last_stop, self.config.min_idle_ms, t)
    }

    /// Minimum runtime honoured (only constrains STARTING/RUNNING)
    pub fn is_stoppable(&self, state: RunState, t: Timestamp) -> bool {
        self.stoppable_in(state, t) == 0
    }

    pub fn stoppable_in(&self, state: RunState, t: Timestamp) -> i64 {
        if !state.is_active() {
            return 0;
        }
        remaining(self.times.last_start, self.config.min_runtime_ms, t)
    }

    pub(crate) fn record_write(&mut self, t: Timestamp) {
        self.times.last_write = Some(t);
    }

    pub(crate) fn record_start(&mut self, t: Timestamp) {
        self.times.last_start = Some(t);
    }

    pub(crate) fn record_stop(&mut self, t: Timestamp) {
        self.times.last_stop = Some(t);
    }
}
