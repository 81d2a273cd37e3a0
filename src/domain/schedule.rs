use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::value::{Timestamp, Value};

/// Time-ordered setpoints; each entry holds from its timestamp until superseded.
///
/// The order is caller-supplied and never rearranged here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    entries: Vec<Value>,
}

impl Schedule {
    pub fn new(entries: Vec<Value>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.entries.iter()
    }

    /// Non-decreasing timestamps
    pub fn is_monotonic(&self) -> bool {
        self.entries
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp)
    }

    /// Setpoint in force at `t`
    pub fn value_at(&self, t: Timestamp) -> Option<&Value> {
        self.entries.iter().rev().find(|v| v.timestamp <= t)
    }
}

impl FromIterator<Value> for Schedule {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// One planner output: a sub-schedule per component id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleBundle {
    pub id: Uuid,
    /// Monotonically increasing version; a newer bundle replaces an older one
    pub timestamp: Timestamp,
    pub schedules: HashMap<String, Schedule>,
}

impl ScheduleBundle {
    pub fn new(timestamp: Timestamp, schedules: HashMap<String, Schedule>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            schedules,
        }
    }

    pub fn get(&self, component_id: &str) -> Option<&Schedule> {
        self.schedules.get(component_id)
    }

    pub fn is_newer_than(&self, other: &ScheduleBundle) -> bool {
        self.timestamp > other.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched(points: &[(i64, f64)]) -> Schedule {
        points
            .iter()
            .map(|(t, v)| Value::double(Timestamp(*t), *v))
            .collect()
    }

    #[test]
    fn test_monotonic() {
        assert!(sched(&[(0, 1.0), (0, 2.0), (5, 3.0)]).is_monotonic());
        assert!(!sched(&[(10, 1.0), (5, 2.0)]).is_monotonic());
        assert!(Schedule::default().is_monotonic());
    }

    #[test]
    fn test_value_at() {
        let s = sched(&[(0, 1.0), (100, 2.0)]);
        assert_eq!(s.value_at(Timestamp(50)).and_then(|v| v.as_f64()), Some(1.0));
        assert_eq!(s.value_at(Timestamp(100)).and_then(|v| v.as_f64()), Some(2.0));
        assert!(s.value_at(Timestamp(-1)).is_none());
    }

    #[test]
    fn test_bundle_ordering() {
        let old = ScheduleBundle::new(Timestamp(1), HashMap::new());
        let new = ScheduleBundle::new(Timestamp(2), HashMap::new());
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
        assert!(!old.is_newer_than(&old.clone()));
    }
}
