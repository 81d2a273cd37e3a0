#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use energy_orchestrator::channel::{ChannelId, MemoryChannelStore};
use energy_orchestrator::component::{Component, ComponentSettings, GuardConfig};
use energy_orchestrator::config::{Config, ManagerConfig};
use energy_orchestrator::devices::{
    ComponentFactory, GeneratorConfig, GeneratorHooks, RunnableConfig, RunnableHooks,
};
use energy_orchestrator::domain::{
    Capability, CapabilitySet, Clock, ComponentType, ManualClock, RunState, Timestamp,
};

/// Shared clock and store for one scenario
pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryChannelStore>,
}

impl Rig {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let store = Arc::new(MemoryChannelStore::new(clock.clone()));
        Self { clock, store }
    }

    pub fn at(&self, millis: i64) {
        self.clock.set(Timestamp(millis));
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Power-setpoint device on `<id>/power`, feedback on `<id>/measured` when `feedback`
    pub fn generator(&self, id: &str, guard: GuardConfig, feedback: bool) -> Arc<Component> {
        Arc::new(Component::new(
            id,
            ComponentType::Cogenerator,
            CapabilitySet::empty()
                .with(Capability::Runnable)
                .with(Capability::Schedulable)
                .with(Capability::Flexible),
            Arc::new(GeneratorHooks::new(GeneratorConfig {
                setpoint_channel: ChannelId::new(format!("{id}/power")),
                feedback_channel: feedback.then(|| ChannelId::new(format!("{id}/measured"))),
                ..GeneratorConfig::default()
            })),
            self.store.clone(),
            self.clock.clone(),
            ComponentSettings {
                guard,
                ..ComponentSettings::default()
            },
        ))
    }

    /// On/off device with state on `<id>/state` and stage on `<id>/stage`
    pub fn runnable(&self, id: &str, guard: GuardConfig) -> Arc<Component> {
        Arc::new(Component::new(
            id,
            ComponentType::HeatingRod,
            CapabilitySet::empty()
                .with(Capability::Runnable)
                .with(Capability::Flexible),
            Arc::new(RunnableHooks::new(RunnableConfig {
                state_channel: ChannelId::new(format!("{id}/state")),
                setpoint_channel: Some(ChannelId::new(format!("{id}/stage"))),
                feedback_channel: None,
            })),
            self.store.clone(),
            self.clock.clone(),
            ComponentSettings {
                guard,
                ..ComponentSettings::default()
            },
        ))
    }

    pub fn build_all(&self, toml: &str) -> Vec<Arc<Component>> {
        let cfg = Config::from_toml_str(toml).unwrap();
        ComponentFactory::new(self.store.clone(), self.clock.clone(), ManagerConfig::default())
            .build_all(&cfg)
            .unwrap()
    }
}

pub fn guard(min_runtime_ms: i64, min_idle_ms: i64, write_debounce_ms: i64) -> GuardConfig {
    GuardConfig {
        min_runtime_ms,
        min_idle_ms,
        write_debounce_ms,
    }
}

/// Poll until the component reaches `state`; feedback is applied on a worker task
pub async fn wait_for(component: &Component, state: RunState) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while component.run_state().await != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "{} stuck in {} waiting for {}",
        component.id(),
        component.run_state().await,
        state
    );
}
