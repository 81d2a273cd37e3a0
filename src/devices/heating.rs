//! Heating-water / domestic-water sub-handlers.
//!
//! Each circuit watches a temperature and a setpoint channel and keeps a
//! hysteresis decision: demand heat below `setpoint - hysteresis`, satisfied
//! at `setpoint + hysteresis`, unchanged in between.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, warn};

use crate::channel::{read_f64, ChannelId, ChannelStore, ValueListener};
use crate::component::Prerequisite;
use crate::domain::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitKind {
    HeatingWater,
    DomesticWater,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatingCircuitConfig {
    pub kind: CircuitKind,
    pub temperature_channel: ChannelId,
    pub setpoint_channel: ChannelId,
    pub hysteresis_k: f64,
}

/// Current hysteresis decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub startable: bool,
    pub stoppable: bool,
}

impl Default for Demand {
    fn default() -> Self {
        Self {
            startable: false,
            stoppable: true,
        }
    }
}

pub struct HeatingCircuit {
    name: String,
    config: HeatingCircuitConfig,
    store: Arc<dyn ChannelStore>,
    demand: Mutex<Demand>,
}

impl HeatingCircuit {
    pub fn new(owner: &str, config: HeatingCircuitConfig, store: Arc<dyn ChannelStore>) -> Self {
        Self {
            name: format!("{owner}/{}", config.kind),
            config,
            store,
            demand: Mutex::new(Demand::default()),
        }
    }

    pub fn kind(&self) -> CircuitKind {
        self.config.kind
    }

    pub fn demand(&self) -> Demand {
        *self.demand.lock()
    }

    /// Re-evaluate from the latest readings. A failed or missing reading means
    /// no demand; the stop decision is kept.
    pub fn recompute(&self) -> Demand {
        let temperature = read_f64(self.store.as_ref(), &self.config.temperature_channel);
        let setpoint = read_f64(self.store.as_ref(), &self.config.setpoint_channel);
        let mut demand = self.demand.lock();
        match (temperature, setpoint) {
            (Ok(Some(t)), Ok(Some(sp))) => {
                let h = self.config.hysteresis_k;
                if t < sp - h {
                    *demand = Demand {
                        startable: true,
                        stoppable: false,
                    };
                } else if t >= sp + h {
                    *demand = Demand {
                        startable: false,
                        stoppable: true,
                    };
                }
                debug!(circuit = %self.name, temperature_c = t, setpoint_c = sp, startable = demand.startable, "circuit evaluated");
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(circuit = %self.name, error = %e, "circuit reading failed, no heat demand");
                demand.startable = false;
            }
            _ => {
                debug!(circuit = %self.name, "circuit has no readings yet");
                demand.startable = false;
            }
        }
        *demand
    }

    fn channels(&self) -> [&ChannelId; 2] {
        [&self.config.temperature_channel, &self.config.setpoint_channel]
    }
}

impl ValueListener for HeatingCircuit {
    fn on_value(&self, _channel: &ChannelId, _value: &Value) {
        self.recompute();
    }
}

impl Prerequisite for HeatingCircuit {
    fn name(&self) -> &str {
        &self.name
    }

    fn allows_start(&self) -> bool {
        self.demand().startable
    }

    fn allows_stop(&self) -> bool {
        self.demand().stoppable
    }

    fn attach(self: Arc<Self>) {
        let listener: Arc<dyn ValueListener> = self.clone();
        for channel in self.channels() {
            self.store.register_listener(channel, listener.clone());
        }
        self.recompute();
    }

    fn detach(self: Arc<Self>) {
        let listener: Arc<dyn ValueListener> = self.clone();
        for channel in self.channels() {
            self.store.deregister_listener(channel, &listener);
        }
    }
}
