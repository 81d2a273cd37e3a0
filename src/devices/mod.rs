//! Device hook families and the factory that builds components from configuration.

pub mod circulation;
pub mod factory;
pub mod generator;
pub mod heating;
pub mod runnable;
pub mod thermal;

pub use circulation::CirculationPumpFollower;
pub use factory::{ComponentFactory, DeviceKind};
pub use generator::{GeneratorConfig, GeneratorHooks};
pub use heating::{CircuitKind, Demand, HeatingCircuit, HeatingCircuitConfig};
pub use runnable::{RunnableConfig, RunnableHooks};
pub use thermal::{StorageLayer, ThermalStorageConfig, ThermalStorageHooks};
