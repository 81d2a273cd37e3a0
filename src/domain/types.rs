use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use super::value::Timestamp;

// ============================================================================
// Component classification
// ============================================================================

/// Kind of physical device a component models
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum ComponentType {
    Inverter,
    ElectricalStorage,
    ThermalStorage,
    ElectricVehicle,
    Cogenerator,
    HeatPump,
    HeatingRod,
    Ventilation,
    Appliance,
    Control,
}

/// Orthogonal behaviour facet of a component
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Capability {
    Runnable,
    Schedulable,
    Flexible,
    Heating,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Capability::Runnable => 1 << 0,
            Capability::Schedulable => 1 << 1,
            Capability::Flexible => 1 << 2,
            Capability::Heating => 1 << 3,
        }
    }
}

/// Set of capabilities; checked explicitly instead of inspecting concrete types
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<Capability>", from = "Vec<Capability>")]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Capability::iter().collect()
    }

    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    pub const fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl From<Vec<Capability>> for CapabilitySet {
    fn from(v: Vec<Capability>) -> Self {
        v.into_iter().collect()
    }
}

impl From<CapabilitySet> for Vec<Capability> {
    fn from(set: CapabilitySet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ============================================================================
// Run state and status
// ============================================================================

/// Modeled lifecycle state of a component
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Standby,
    Starting,
    Running,
    Stopping,
    Disabled,
}

impl RunState {
    /// STARTING or RUNNING
    pub const fn is_active(&self) -> bool {
        matches!(self, RunState::Starting | RunState::Running)
    }

    /// STANDBY or STOPPING
    pub const fn is_idle(&self) -> bool {
        matches!(self, RunState::Standby | RunState::Stopping)
    }
}

/// Operating status imposed by the orchestrator
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentStatus {
    #[default]
    Enabled,
    /// Actuation suppressed, observation continues
    Maintenance,
}

/// Snapshot of a component's identity and timing state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub id: String,
    pub component_type: ComponentType,
    pub capabilities: CapabilitySet,
    pub run_state: RunState,
    pub status: ComponentStatus,
    pub last_start: Option<Timestamp>,
    pub last_stop: Option<Timestamp>,
    pub last_write: Option<Timestamp>,
}

impl ComponentRecord {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }
}
