//! # Schedule compiler
//!
//! Turns a setpoint schedule into the minimal start/stop/set sequence that
//! reproduces it:
//!
//! 1. the stop value compiles to a stop, unless the minimum runtime since the
//!    last start has not elapsed at that entry (skipped and logged);
//! 2. the first non-stop value after a gap (or at the head) compiles to a start;
//! 3. a changed non-stop value compiles to a plain set;
//! 4. anything else is coalesced away.
//!
//! "Previous" always means the previous *effective* setpoint: a skipped stop
//! leaves the device running on what it had, so the next entry is compared
//! against that.

use strum::Display;
use tracing::{info, warn};

use crate::domain::{Payload, Schedule, Timestamp, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ActionKind {
    Start,
    Stop,
    Set,
}

/// One compiled action, pointing back to the schedule entry it came from
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledAction {
    pub index: usize,
    pub kind: ActionKind,
    pub value: Value,
}

impl CompiledAction {
    pub fn timestamp(&self) -> Timestamp {
        self.value.timestamp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MinRuntime { remaining_ms: i64 },
    NonMonotonic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    pub index: usize,
    pub timestamp: Timestamp,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledSchedule {
    pub actions: Vec<CompiledAction>,
    pub skipped: Vec<SkippedEntry>,
}

impl CompiledSchedule {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Timestamp of the last action of `kind`
    pub fn last_of(&self, kind: ActionKind) -> Option<Timestamp> {
        self.actions
            .iter()
            .rev()
            .find(|a| a.kind == kind)
            .map(CompiledAction::timestamp)
    }

    /// Timestamp of the last action of `kind` that is due at `now`
    pub fn last_due(&self, kind: ActionKind, now: Timestamp) -> Option<Timestamp> {
        self.actions
            .iter()
            .rev()
            .filter(|a| a.timestamp() <= now)
            .find(|a| a.kind == kind)
            .map(CompiledAction::timestamp)
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleCompiler {
    stop_value: Payload,
    min_runtime_ms: i64,
}

impl ScheduleCompiler {
    pub fn new(stop_value: Payload, min_runtime_ms: i64) -> Self {
        Self {
            stop_value,
            min_runtime_ms,
        }
    }

    pub fn is_stop_value(&self, value: &Value) -> bool {
        value.payload.same_setpoint(&self.stop_value)
    }

    /// Compile `schedule` given the time of the last start. Total: never fails.
    pub fn compile(&self, schedule: &Schedule, last_start: Option<Timestamp>) -> CompiledSchedule {
        let mut out = CompiledSchedule::default();
        let mut last_start = last_start;
        let mut previous: Option<&Value> = None;
        let mut last_time: Option<Timestamp> = None;

        for (index, value) in schedule.iter().enumerate() {
            if matches!(last_time, Some(t) if value.timestamp < t) {
                warn!(index, timestamp = %value.timestamp, "schedule entry goes back in time, skipped");
                out.skipped.push(SkippedEntry {
                    index,
                    timestamp: value.timestamp,
                    reason: SkipReason::NonMonotonic,
                });
                continue;
            }
            last_time = Some(value.timestamp);

            let previous_is_stop = previous.map(|p| self.is_stop_value(p));
            if self.is_stop_value(value) {
                if previous_is_stop == Some(true) {
                    continue;
                }
                if let Some(started) = last_start {
                    let ran = value.timestamp.millis_since(started);
                    if ran < self.min_runtime_ms {
                        let remaining_ms = self.min_runtime_ms - ran;
                        info!(index, timestamp = %value.timestamp, remaining_ms, "stop skipped: minimum runtime not reached");
                        out.skipped.push(SkippedEntry {
                            index,
                            timestamp: value.timestamp,
                            reason: SkipReason::MinRuntime { remaining_ms },
                        });
                        continue;
                    }
                }
                out.actions.push(CompiledAction {
                    index,
                    kind: ActionKind::Stop,
                    value: value.clone(),
                });
            } else if previous_is_stop.unwrap_or(true) {
                last_start = Some(value.timestamp);
                out.actions.push(CompiledAction {
                    index,
                    kind: ActionKind::Start,
                    value: value.clone(),
                });
            } else if previous.is_some_and(|p| !p.same_setpoint(value)) {
                out.actions.push(CompiledAction {
                    index,
                    kind: ActionKind::Set,
                    value: value.clone(),
                });
            } else {
                continue;
            }
            previous = Some(value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const MINUTE: i64 = 60_000;

    fn schedule(points: &[(i64, f64)]) -> Schedule {
        points
            .iter()
            .map(|(t, v)| Value::double(Timestamp(*t), *v))
            .collect()
    }

    fn kinds(compiled: &CompiledSchedule) -> Vec<(usize, ActionKind)> {
        compiled.actions.iter().map(|a| (a.index, a.kind)).collect()
    }

    fn compiler(min_runtime_ms: i64) -> ScheduleCompiler {
        ScheduleCompiler::new(Payload::Double(0.0), min_runtime_ms)
    }

    #[test]
    fn test_repeated_setpoint_is_one_start() {
        let c = compiler(0).compile(&schedule(&[(0, 5.0), (MINUTE, 5.0), (2 * MINUTE, 5.0)]), None);
        assert_eq!(kinds(&c), vec![(0, ActionKind::Start)]);
        assert_eq!(c.count(ActionKind::Set), 0);
    }

    #[test]
    fn test_gap_restarts() {
        let c = compiler(MINUTE).compile(&schedule(&[(0, 5.0), (MINUTE, 0.0), (2 * MINUTE, 5.0)]), None);
        assert_eq!(
            kinds(&c),
            vec![(0, ActionKind::Start), (1, ActionKind::Stop), (2, ActionKind::Start)]
        );
        assert_eq!(c.last_of(ActionKind::Start), Some(Timestamp(2 * MINUTE)));
    }

    #[test]
    fn test_last_due_ignores_future_actions() {
        let c = compiler(MINUTE).compile(&schedule(&[(0, 5.0), (MINUTE, 0.0), (2 * MINUTE, 5.0)]), None);
        let now = Timestamp(MINUTE + 1);
        assert_eq!(c.last_due(ActionKind::Start, now), Some(Timestamp(0)));
        assert_eq!(c.last_due(ActionKind::Stop, now), Some(Timestamp(MINUTE)));
        assert_eq!(c.last_due(ActionKind::Start, Timestamp(-1)), None);
    }

    #[test]
    fn test_early_stop_is_skipped_and_device_keeps_running() {
        let c = compiler(10 * MINUTE).compile(&schedule(&[(0, 5.0), (MINUTE, 0.0), (2 * MINUTE, 5.0)]), None);
        assert_eq!(kinds(&c), vec![(0, ActionKind::Start)]);
        assert_eq!(c.skipped.len(), 1);
        assert_eq!(c.skipped[0].index, 1);
        assert_eq!(
            c.skipped[0].reason,
            SkipReason::MinRuntime {
                remaining_ms: 9 * MINUTE
            }
        );
    }

    #[test]
    fn test_min_runtime_counts_from_previous_start() {
        // started 30 min ago, min runtime 10 min: stop at head is allowed
        let c = compiler(10 * MINUTE).compile(&schedule(&[(30 * MINUTE, 0.0)]), Some(Timestamp(0)));
        assert_eq!(kinds(&c), vec![(0, ActionKind::Stop)]);

        let c = compiler(10 * MINUTE).compile(&schedule(&[(5 * MINUTE, 0.0)]), Some(Timestamp(0)));
        assert!(c.is_empty());
    }

    #[rstest]
    #[case(&[(0, 5.0), (1, 6.0), (2, 6.0), (3, 7.0)], &[ActionKind::Start, ActionKind::Set, ActionKind::Set])]
    #[case(&[(0, 0.0), (1, 0.0), (2, 3.0)], &[ActionKind::Stop, ActionKind::Start])]
    #[case(&[(0, 3.0), (1, 0.0), (2, 0.0)], &[ActionKind::Start, ActionKind::Stop])]
    #[case(&[], &[])]
    fn test_action_sequences(#[case] points: &[(i64, f64)], #[case] expected: &[ActionKind]) {
        let c = compiler(0).compile(&schedule(points), None);
        let got: Vec<ActionKind> = c.actions.iter().map(|a| a.kind).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_non_monotonic_entry_is_skipped() {
        let c = compiler(0).compile(&schedule(&[(10, 5.0), (5, 7.0), (20, 7.0)]), None);
        assert_eq!(kinds(&c), vec![(0, ActionKind::Start), (2, ActionKind::Set)]);
        assert_eq!(c.skipped[0].reason, SkipReason::NonMonotonic);
    }

    #[test]
    fn test_integer_and_double_setpoints_compare_numerically() {
        let s: Schedule = vec![
            Value::int(Timestamp(0), 5),
            Value::double(Timestamp(1), 5.0),
            Value::long(Timestamp(2), 0),
        ]
        .into_iter()
        .collect();
        let c = compiler(0).compile(&s, None);
        let got: Vec<ActionKind> = c.actions.iter().map(|a| a.kind).collect();
        assert_eq!(got, vec![ActionKind::Start, ActionKind::Stop]);
    }

    proptest! {
        #[test]
        fn prop_compiled_actions_are_minimal(
            steps in prop::collection::vec((0i64..5 * MINUTE, 0u8..4), 0..40),
            min_runtime in 0i64..20 * MINUTE,
        ) {
            let mut t = 0;
            let points: Vec<(i64, f64)> = steps
                .into_iter()
                .map(|(dt, v)| {
                    t += dt;
                    (t, f64::from(v))
                })
                .collect();
            let c = compiler(min_runtime).compile(&schedule(&points), None);

            for pair in c.actions.windows(2) {
                prop_assert!(!pair[0].value.same_setpoint(&pair[1].value));
                prop_assert!(pair[0].timestamp() <= pair[1].timestamp());
                prop_assert!(pair[0].index < pair[1].index);
            }
            for (i, action) in c.actions.iter().enumerate() {
                if action.kind == ActionKind::Stop {
                    if let Some(start) = c.actions[..i].iter().rev().find(|a| a.kind == ActionKind::Start) {
                        prop_assert!(action.timestamp().millis_since(start.timestamp()) >= min_runtime);
                    }
                }
            }
        }
    }
}
