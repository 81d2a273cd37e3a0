use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::circulation::CirculationPumpFollower;
use super::generator::{GeneratorConfig, GeneratorHooks};
use super::heating::{CircuitKind, HeatingCircuit, HeatingCircuitConfig};
use super::runnable::{RunnableConfig, RunnableHooks};
use super::thermal::{StorageLayer, ThermalStorageConfig, ThermalStorageHooks};
use crate::channel::ChannelStore;
use crate::component::{Component, ComponentSettings, DeviceHooks, GuardConfig, Prerequisite};
use crate::config::{bind, BoundConfig, ConfigSource, ConfigSourceExt, FieldKind, FieldSpec, ManagerConfig};
use crate::domain::{Capability, CapabilitySet, Clock, ComponentType};
use crate::error::ConfigError;

const COMMON: &[FieldSpec] = &[
    FieldSpec::required("type", "type", FieldKind::Text),
    FieldSpec::optional("capabilities", "capabilities", FieldKind::TextList),
    FieldSpec::optional("min_runtime", "min_runtime_s", FieldKind::Number).scaled(1_000.0),
    FieldSpec::optional("min_idle", "min_idle_s", FieldKind::Number).scaled(1_000.0),
    FieldSpec::optional("debounce", "write_debounce_ms", FieldKind::Number),
    FieldSpec::optional("feedback", "feedback_channel", FieldKind::Text),
    FieldSpec::optional("follows", "follows", FieldKind::Text),
];

const GENERATOR: &[FieldSpec] = &[
    FieldSpec::required("setpoint", "setpoint_channel", FieldKind::Text),
    FieldSpec::optional("default_power", "default_power_kw", FieldKind::Number).scaled(1_000.0),
    FieldSpec::optional("threshold", "feedback_on_threshold_w", FieldKind::Number),
    FieldSpec::optional("limit", "power_limit_channel", FieldKind::Text),
];

const RUNNABLE: &[FieldSpec] = &[
    FieldSpec::required("state", "state_channel", FieldKind::Text),
    FieldSpec::optional("setpoint", "setpoint_channel", FieldKind::Text),
];

const THERMAL: &[FieldSpec] = &[
    FieldSpec::required("layers", "layer_channels", FieldKind::TextList),
    FieldSpec::optional("volume", "volume_l", FieldKind::Number),
    FieldSpec::optional("reference", "reference_temp_c", FieldKind::Number),
    FieldSpec::required("average", "average_temp_channel", FieldKind::Text),
    FieldSpec::required("energy", "energy_channel", FieldKind::Text),
    FieldSpec::required("power", "power_channel", FieldKind::Text),
];

const HEATING: &[FieldSpec] = &[
    FieldSpec::optional("hw_temp", "heating_water_temperature_channel", FieldKind::Text),
    FieldSpec::optional("hw_setpoint", "heating_water_setpoint_channel", FieldKind::Text),
    FieldSpec::optional("dhw_temp", "domestic_water_temperature_channel", FieldKind::Text),
    FieldSpec::optional("dhw_setpoint", "domestic_water_setpoint_channel", FieldKind::Text),
    FieldSpec::optional("hysteresis", "hysteresis_k", FieldKind::Number),
];

/// Which hook family drives a component type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Generator,
    Runnable,
    ThermalStorage,
}

impl DeviceKind {
    pub fn of(component_type: ComponentType) -> Self {
        match component_type {
            ComponentType::Inverter
            | ComponentType::ElectricalStorage
            | ComponentType::ElectricVehicle
            | ComponentType::Cogenerator
            | ComponentType::HeatPump => DeviceKind::Generator,
            ComponentType::HeatingRod
            | ComponentType::Ventilation
            | ComponentType::Appliance
            | ComponentType::Control => DeviceKind::Runnable,
            ComponentType::ThermalStorage => DeviceKind::ThermalStorage,
        }
    }

    fn default_capabilities(&self, component_type: ComponentType) -> CapabilitySet {
        match self {
            DeviceKind::ThermalStorage => CapabilitySet::empty().with(Capability::Heating),
            _ if component_type == ComponentType::Control => {
                CapabilitySet::empty().with(Capability::Runnable)
            }
            _ => CapabilitySet::empty()
                .with(Capability::Runnable)
                .with(Capability::Schedulable)
                .with(Capability::Flexible),
        }
    }
}

/// Builds components from configuration sections
pub struct ComponentFactory {
    store: Arc<dyn ChannelStore>,
    clock: Arc<dyn Clock>,
    manager: ManagerConfig,
}

impl ComponentFactory {
    pub fn new(store: Arc<dyn ChannelStore>, clock: Arc<dyn Clock>, manager: ManagerConfig) -> Self {
        Self {
            store,
            clock,
            manager,
        }
    }

    pub fn build(&self, source: &dyn ConfigSource, id: &str) -> Result<Arc<Component>, ConfigError> {
        self.build_section(source, id).map(|(component, _)| component)
    }

    /// Build every section and wire circulation pumps to their heat sources
    pub fn build_all(&self, source: &dyn ConfigSource) -> Result<Vec<Arc<Component>>, ConfigError> {
        let mut built = Vec::new();
        for id in source.sections() {
            built.push(self.build_section(source, &id)?);
        }
        for (pump, follows) in &built {
            let Some(follows) = follows else { continue };
            let Some((heat_source, _)) = built.iter().find(|(c, _)| c.id() == follows) else {
                return Err(ConfigError::InvalidField {
                    section: pump.id().to_string(),
                    key: "follows".into(),
                    reason: format!("unknown component {follows}"),
                });
            };
            CirculationPumpFollower::attach(heat_source, pump);
            info!(pump = pump.id(), source = heat_source.id(), "circulation pump follows heat source");
        }
        Ok(built.into_iter().map(|(c, _)| c).collect())
    }

    fn build_section(
        &self,
        source: &dyn ConfigSource,
        id: &str,
    ) -> Result<(Arc<Component>, Option<String>), ConfigError> {
        let common = bind(source, id, COMMON)?;
        let component_type = common
            .text("type")
            .map(ComponentType::from_str)
            .transpose()
            .map_err(|e| invalid(id, "type", e))?
            .ok_or_else(|| invalid(id, "type", "missing"))?;
        let kind = DeviceKind::of(component_type);

        let hooks: Arc<dyn DeviceHooks> = match kind {
            DeviceKind::Generator => {
                let f = bind(source, id, GENERATOR)?;
                let defaults = GeneratorConfig::default();
                Arc::new(GeneratorHooks::new(GeneratorConfig {
                    setpoint_channel: f.require_channel("setpoint")?,
                    default_power_w: f.number("default_power").unwrap_or(defaults.default_power_w),
                    feedback_channel: common.channel("feedback"),
                    on_threshold_w: f.number("threshold").unwrap_or(defaults.on_threshold_w),
                    power_limit_channel: f.channel("limit"),
                }))
            }
            DeviceKind::Runnable => {
                let f = bind(source, id, RUNNABLE)?;
                Arc::new(RunnableHooks::new(RunnableConfig {
                    state_channel: f.require_channel("state")?,
                    setpoint_channel: f.channel("setpoint"),
                    feedback_channel: common.channel("feedback"),
                }))
            }
            DeviceKind::ThermalStorage => Arc::new(ThermalStorageHooks::new(thermal_config(source, id)?)),
        };

        let circuits = heating_circuits(source, id, self.store.clone())?;
        let mut capabilities = match common.text_list("capabilities") {
            Some(names) => parse_capabilities(id, names)?,
            None => kind.default_capabilities(component_type),
        };
        if !circuits.is_empty() {
            capabilities = capabilities.with(Capability::Heating);
        }
        if capabilities.is_empty() {
            return Err(invalid(id, "capabilities", "at least one capability is required"));
        }

        let settings = ComponentSettings {
            guard: guard_config(&common),
            enabled: source.is_enabled(id),
            write_timeout: self.manager.write_timeout(),
            validation_interval_ms: i64::try_from(self.manager.validation_interval_ms).unwrap_or(i64::MAX),
        };
        if !settings.enabled {
            warn!(component = id, "component configured disabled");
        }

        let component = Component::new(
            id,
            component_type,
            capabilities,
            hooks,
            self.store.clone(),
            self.clock.clone(),
            settings,
        )
        .with_prerequisites(circuits);
        Ok((Arc::new(component), common.text("follows").map(str::to_string)))
    }
}

fn invalid(section: &str, key: &str, reason: impl ToString) -> ConfigError {
    ConfigError::InvalidField {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn guard_config(common: &BoundConfig) -> GuardConfig {
    GuardConfig {
        min_runtime_ms: common.millis("min_runtime").unwrap_or(0).max(0),
        min_idle_ms: common.millis("min_idle").unwrap_or(0).max(0),
        write_debounce_ms: common.millis("debounce").unwrap_or(0).max(0),
    }
}

fn parse_capabilities(id: &str, names: &[String]) -> Result<CapabilitySet, ConfigError> {
    names
        .iter()
        .map(|n| Capability::from_str(n).map_err(|_| invalid(id, "capabilities", format!("unknown capability {n}"))))
        .collect()
}

fn thermal_config(source: &dyn ConfigSource, id: &str) -> Result<ThermalStorageConfig, ConfigError> {
    let f = bind(source, id, THERMAL)?;
    let defaults = ThermalStorageConfig::default();
    let channels = f.text_list("layers").unwrap_or_default();
    let shares: Vec<f64> = source
        .get(id, "layer_shares")?
        .unwrap_or_else(|| vec![1.0; channels.len()]);
    if shares.len() != channels.len() {
        return Err(invalid(id, "layer_shares", "one share per layer channel expected"));
    }
    Ok(ThermalStorageConfig {
        layers: channels
            .iter()
            .zip(shares)
            .map(|(channel, volume_share)| StorageLayer {
                temperature_channel: channel.as_str().into(),
                volume_share,
            })
            .collect(),
        volume_l: f.number("volume").unwrap_or(defaults.volume_l),
        reference_temp_c: f.number("reference").unwrap_or(defaults.reference_temp_c),
        average_temp_channel: f.require_channel("average")?,
        energy_channel: f.require_channel("energy")?,
        power_channel: f.require_channel("power")?,
    })
}

/// Circuits are configured as temperature/setpoint channel pairs; a half
/// configured pair is an error.
fn heating_circuits(
    source: &dyn ConfigSource,
    id: &str,
    store: Arc<dyn ChannelStore>,
) -> Result<Vec<Arc<dyn Prerequisite>>, ConfigError> {
    let f = bind(source, id, HEATING)?;
    let hysteresis_k = f.number("hysteresis").unwrap_or(2.0);
    let mut circuits: Vec<Arc<dyn Prerequisite>> = Vec::new();
    for (kind, temp, setpoint) in [
        (CircuitKind::HeatingWater, "hw_temp", "hw_setpoint"),
        (CircuitKind::DomesticWater, "dhw_temp", "dhw_setpoint"),
    ] {
        match (f.channel(temp), f.channel(setpoint)) {
            (Some(temperature_channel), Some(setpoint_channel)) => {
                circuits.push(Arc::new(HeatingCircuit::new(
                    id,
                    HeatingCircuitConfig {
                        kind,
                        temperature_channel,
                        setpoint_channel,
                        hysteresis_k,
                    },
                    store.clone(),
                )));
            }
            (None, None) => {}
            _ => {
                return Err(invalid(
                    id,
                    &kind.to_string().to_lowercase(),
                    "temperature and setpoint channel must be configured together",
                ))
            }
        }
    }
    Ok(circuits)
}
