use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Timestamp
// ============================================================================

/// Point in time as epoch milliseconds.
///
/// All guard arithmetic happens on raw milliseconds so that schedules coming
/// from planners (which speak epoch millis) need no conversion.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Current wall clock time
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier` (negative if `earlier` lies in the future)
    pub const fn millis_since(&self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }

    pub const fn plus_millis(&self, millis: i64) -> Self {
        Self(self.0 + millis)
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

// ============================================================================
// Value
// ============================================================================

/// Typed payload of a channel reading or write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Payload {
    /// Numeric view of the payload; bools map to 0/1, strings have none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Payload::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Payload::Byte(v) => Some(f64::from(*v)),
            Payload::Short(v) => Some(f64::from(*v)),
            Payload::Int(v) => Some(f64::from(*v)),
            Payload::Long(v) => Some(*v as f64),
            Payload::Float(v) => Some(f64::from(*v)),
            Payload::Double(v) => Some(*v),
            Payload::String(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Payload::Bool(b) => Some(*b),
            Payload::String(s) => s.parse().ok(),
            other => other.as_f64().filter(|v| !v.is_nan()).map(|v| v != 0.0),
        }
    }

    /// Setpoint equality: numeric payloads compare by value regardless of width.
    pub fn same_setpoint(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::String(a), Payload::String(b)) => a == b,
            (Payload::String(_), _) | (_, Payload::String(_)) => false,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bool(v) => write!(f, "{v}"),
            Payload::Byte(v) => write!(f, "{v}"),
            Payload::Short(v) => write!(f, "{v}"),
            Payload::Int(v) => write!(f, "{v}"),
            Payload::Long(v) => write!(f, "{v}"),
            Payload::Float(v) => write!(f, "{v}"),
            Payload::Double(v) => write!(f, "{v}"),
            Payload::String(v) => write!(f, "\"{v}\""),
        }
    }
}

/// Immutable, timestamped reading or write.
///
/// Equality compares tag, timestamp and payload. Use [`Value::same_setpoint`]
/// when only the payload matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub timestamp: Timestamp,
    pub payload: Payload,
}

impl Value {
    pub fn new(timestamp: Timestamp, payload: Payload) -> Self {
        Self { timestamp, payload }
    }

    pub fn bool(timestamp: Timestamp, v: bool) -> Self {
        Self::new(timestamp, Payload::Bool(v))
    }

    pub fn double(timestamp: Timestamp, v: f64) -> Self {
        Self::new(timestamp, Payload::Double(v))
    }

    pub fn int(timestamp: Timestamp, v: i32) -> Self {
        Self::new(timestamp, Payload::Int(v))
    }

    pub fn long(timestamp: Timestamp, v: i64) -> Self {
        Self::new(timestamp, Payload::Long(v))
    }

    /// "No data yet" sentinel
    pub fn empty(timestamp: Timestamp) -> Self {
        Self::double(timestamp, f64::NAN)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.payload, Payload::Double(v) if v.is_nan())
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.payload.as_f64()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.payload.as_bool()
    }

    pub fn same_setpoint(&self, other: &Value) -> bool {
        self.payload.same_setpoint(&other.payload)
    }

    /// Same payload, different time
    pub fn at(&self, timestamp: Timestamp) -> Self {
        Self::new(timestamp, self.payload.clone())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.payload, self.timestamp)
    }
}
