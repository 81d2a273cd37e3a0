//! Run-state control engine for building energy-management components.
//!
//! Components (generators, heat pumps, heating rods, pumps, storage tanks)
//! are driven through a uniform start/stop/set/schedule surface that enforces
//! timing constraints, tracks a feedback-aware run state and emits all writes
//! of one action as a single batch. The [`manager::EnergyManager`] loop binds
//! components, applies schedule bundles and runs periodic self-checks.

pub mod channel;
pub mod component;
pub mod config;
pub mod devices;
pub mod domain;
pub mod error;
pub mod manager;
pub mod telemetry;
