//! # Run-state machine
//!
//! ```text
//!   STANDBY --start--> STARTING --feedback on--> RUNNING
//!      ^                                            |
//!      +---feedback off--- STOPPING <----stop-------+
//! ```
//!
//! Write-driven devices (no feedback channel) pass through STARTING/STOPPING
//! as soon as the write was emitted. DISABLED is configuration-driven and
//! absorbs every command.

use crate::domain::{RunState, Timestamp};

/// A single state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RunState,
    pub to: RunState,
}

/// What a `set(value)` amounts to in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetRoute {
    Start,
    Stop,
    Write,
}

#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    feedback_driven: bool,
    /// When feedback started disagreeing with the modeled state
    disagreement_since: Option<Timestamp>,
}

impl RunStateMachine {
    pub fn new(feedback_driven: bool, enabled: bool) -> Self {
        Self {
            state: if enabled {
                RunState::Standby
            } else {
                RunState::Disabled
            },
            feedback_driven,
            disagreement_since: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_feedback_driven(&self) -> bool {
        self.feedback_driven
    }

    fn go(&mut self, to: RunState, out: &mut Vec<Transition>) {
        if self.state != to {
            out.push(Transition {
                from: self.state,
                to,
            });
            self.state = to;
            self.disagreement_since = None;
        }
    }

    /// Start write was emitted
    pub fn begin_start(&mut self) -> Vec<Transition> {
        let mut out = Vec::new();
        if self.state.is_idle() {
            self.go(RunState::Starting, &mut out);
            if !self.feedback_driven {
                self.go(RunState::Running, &mut out);
            }
        }
        out
    }

    /// Stop write was emitted
    pub fn begin_stop(&mut self) -> Vec<Transition> {
        let mut out = Vec::new();
        if self.state.is_active() {
            self.go(RunState::Stopping, &mut out);
            if !self.feedback_driven {
                self.go(RunState::Standby, &mut out);
            }
        }
        out
    }

    /// Device confirmed on/off; only completes pending transitions
    pub fn on_feedback(&mut self, on: bool) -> Option<Transition> {
        let mut out = Vec::new();
        match (self.state, on) {
            (RunState::Starting, true) => self.go(RunState::Running, &mut out),
            (RunState::Stopping, false) => self.go(RunState::Standby, &mut out),
            _ => {}
        }
        out.pop()
    }

    /// Feedback contradicts the modeled state
    pub fn disagrees(&self, on: bool) -> bool {
        match self.state {
            RunState::Standby | RunState::Starting => on,
            RunState::Running | RunState::Stopping => !on,
            RunState::Disabled => false,
        }
    }

    /// Self-check: force the state to what the device reports once the
    /// disagreement has lasted `validation_ms`.
    pub fn reconcile(&mut self, on: bool, now: Timestamp, validation_ms: i64) -> Option<Transition> {
        if !self.disagrees(on) {
            self.disagreement_since = None;
            return None;
        }
        let since = *self.disagreement_since.get_or_insert(now);
        if now.millis_since(since) < validation_ms {
            return None;
        }
        let mut out = Vec::new();
        self.go(if on { RunState::Running } else { RunState::Standby }, &mut out);
        out.pop()
    }

    pub fn disable(&mut self) -> Option<Transition> {
        let mut out = Vec::new();
        self.go(RunState::Disabled, &mut out);
        out.pop()
    }

    pub fn enable(&mut self) -> Option<Transition> {
        let mut out = Vec::new();
        if self.state == RunState::Disabled {
            self.go(RunState::Standby, &mut out);
        }
        out.pop()
    }

    /// Route a setpoint: nonzero while idle starts, the stop value while active stops
    pub fn route_set(&self, is_stop_value: bool) -> SetRoute {
        match (self.state.is_idle(), self.state.is_active(), is_stop_value) {
            (true, _, false) => SetRoute::Start,
            (_, true, true) => SetRoute::Stop,
            _ => SetRoute::Write,
        }
    }
}
