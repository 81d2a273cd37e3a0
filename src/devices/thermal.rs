//! Thermal storage energy balance.
//!
//! The tank is modeled as a stack of layers, each with a temperature sensor
//! and a share of the total volume. Every self-check derives the mean
//! temperature, the stored energy relative to a reference temperature and the
//! charging power since the previous evaluation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{read_f64, ChannelId};
use crate::component::{DeviceHooks, HookContext, WriteBatch};
use crate::domain::{Payload, Timestamp, Value};
use crate::error::ComponentError;

/// J/(kg·K)
pub const WATER_SPECIFIC_HEAT: f64 = 4_186.0;
/// kg/l
pub const WATER_DENSITY: f64 = 0.997;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLayer {
    pub temperature_channel: ChannelId,
    /// Relative weight; shares need not sum to one
    pub volume_share: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalStorageConfig {
    pub layers: Vec<StorageLayer>,
    pub volume_l: f64,
    pub reference_temp_c: f64,
    pub average_temp_channel: ChannelId,
    pub energy_channel: ChannelId,
    pub power_channel: ChannelId,
}

impl Default for ThermalStorageConfig {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            volume_l: 800.0,
            reference_temp_c: 20.0,
            average_temp_channel: ChannelId::from("storage/average_temp"),
            energy_channel: ChannelId::from("storage/energy"),
            power_channel: ChannelId::from("storage/power"),
        }
    }
}

/// Volume-weighted mean over (temperature, weight); NaN samples are ignored
pub fn weighted_average(samples: &[(f64, f64)]) -> Option<f64> {
    let (sum, weight) = samples
        .iter()
        .filter(|(t, w)| !t.is_nan() && *w > 0.0)
        .fold((0.0, 0.0), |(s, w), (t, wi)| (s + t * wi, w + wi));
    (weight > 0.0).then(|| sum / weight)
}

/// E = m·c·(T − T_ref) in joules
pub fn stored_energy_j(volume_l: f64, temp_c: f64, reference_temp_c: f64) -> f64 {
    volume_l * WATER_DENSITY * WATER_SPECIFIC_HEAT * (temp_c - reference_temp_c)
}

/// P = ΔE/Δt in watts; None when no time has passed
pub fn power_w(previous: (Timestamp, f64), current: (Timestamp, f64)) -> Option<f64> {
    let dt_s = current.0.millis_since(previous.0) as f64 / 1_000.0;
    (dt_s > 0.0).then(|| (current.1 - previous.1) / dt_s)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StorageState {
    pub average_temp_c: f64,
    pub energy_j: f64,
    pub power_w: Option<f64>,
}

/// Observation-only hooks: the tank cannot be switched, only measured
pub struct ThermalStorageHooks {
    config: ThermalStorageConfig,
    last: Mutex<Option<(Timestamp, f64)>>,
}

impl ThermalStorageHooks {
    pub fn new(config: ThermalStorageConfig) -> Self {
        Self {
            config,
            last: Mutex::new(None),
        }
    }

    /// Read all layers and update the energy balance. Unreadable layers are
    /// left out; with none left there is nothing to derive.
    pub fn evaluate(&self, ctx: &HookContext<'_>) -> Option<StorageState> {
        let samples: Vec<(f64, f64)> = self
            .config
            .layers
            .iter()
            .filter_map(|layer| match read_f64(ctx.store, &layer.temperature_channel) {
                Ok(Some(t)) => Some((t, layer.volume_share)),
                Ok(None) => None,
                Err(e) => {
                    warn!(component = ctx.id, error = %e, "storage layer unreadable");
                    None
                }
            })
            .collect();
        let Some(average_temp_c) = weighted_average(&samples) else {
            debug!(component = ctx.id, "no storage temperatures available");
            return None;
        };
        let energy_j = stored_energy_j(self.config.volume_l, average_temp_c, self.config.reference_temp_c);
        let mut last = self.last.lock();
        let power_w = last.and_then(|previous| power_w(previous, (ctx.now, energy_j)));
        *last = Some((ctx.now, energy_j));
        Some(StorageState {
            average_temp_c,
            energy_j,
            power_w,
        })
    }
}

impl DeviceHooks for ThermalStorageHooks {
    fn stop_value(&self) -> Payload {
        Payload::Double(0.0)
    }

    fn on_start(
        &self,
        ctx: &HookContext<'_>,
        _batch: &mut WriteBatch,
        _at: Timestamp,
        _setpoint: Option<&Value>,
    ) -> Result<(), ComponentError> {
        Err(ComponentError::unsupported(ctx.id, "start"))
    }

    fn on_stop(&self, ctx: &HookContext<'_>, _batch: &mut WriteBatch, _at: Timestamp) -> Result<(), ComponentError> {
        Err(ComponentError::unsupported(ctx.id, "stop"))
    }

    fn on_set(&self, ctx: &HookContext<'_>, _batch: &mut WriteBatch, _value: &Value) -> Result<(), ComponentError> {
        Err(ComponentError::unsupported(ctx.id, "set"))
    }

    fn derive(&self, ctx: &HookContext<'_>, batch: &mut WriteBatch) -> Result<(), ComponentError> {
        let Some(state) = self.evaluate(ctx) else {
            return Ok(());
        };
        batch.push(&self.config.average_temp_channel, Value::double(ctx.now, state.average_temp_c));
        batch.push(&self.config.energy_channel, Value::double(ctx.now, state.energy_j));
        if let Some(p) = state.power_w {
            batch.push(&self.config.power_channel, Value::double(ctx.now, p));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannelStore;
    use crate::domain::ManualClock;
    use std::sync::Arc;

    #[test]
    fn test_weighted_average() {
        assert_eq!(weighted_average(&[(60.0, 1.0), (40.0, 1.0)]), Some(50.0));
        assert_eq!(weighted_average(&[(60.0, 3.0), (40.0, 1.0)]), Some(55.0));
        assert_eq!(weighted_average(&[(f64::NAN, 1.0), (40.0, 1.0)]), Some(40.0));
        assert_eq!(weighted_average(&[]), None);
    }

    #[test]
    fn test_energy_and_power() {
        let e = stored_energy_j(1_000.0, 30.0, 20.0);
        assert!((e - 1_000.0 * WATER_DENSITY * WATER_SPECIFIC_HEAT * 10.0).abs() < 1e-6);

        let p = power_w((Timestamp(0), 0.0), (Timestamp(3_600_000), 3_600_000.0)).unwrap();
        assert!((p - 1_000.0).abs() < 1e-9);
        assert_eq!(power_w((Timestamp(5), 0.0), (Timestamp(5), 1.0)), None);
    }

    #[test]
    fn test_derive_writes_balance() {
        let store = MemoryChannelStore::new(Arc::new(ManualClock::new(Timestamp(0))));
        let top = ChannelId::from("buffer/top");
        let bottom = ChannelId::from("buffer/bottom");
        let hooks = ThermalStorageHooks::new(ThermalStorageConfig {
            layers: vec![
                StorageLayer { temperature_channel: top.clone(), volume_share: 0.5 },
                StorageLayer { temperature_channel: bottom.clone(), volume_share: 0.5 },
            ],
            ..ThermalStorageConfig::default()
        });

        let mut batch = WriteBatch::new();
        let ctx = HookContext { id: "buffer", store: &store, now: Timestamp(0) };
        hooks.derive(&ctx, &mut batch).unwrap();
        assert!(batch.is_empty());

        store.set_value(&top, Value::double(Timestamp(0), 60.0));
        store.set_value(&bottom, Value::double(Timestamp(0), 40.0));
        let mut batch = WriteBatch::new();
        hooks.derive(&ctx, &mut batch).unwrap();
        // first evaluation has no power yet
        assert_eq!(batch.channels().count(), 2);

        store.set_value(&bottom, Value::double(Timestamp(0), 50.0));
        let ctx = HookContext { id: "buffer", store: &store, now: Timestamp(60_000) };
        let mut batch = WriteBatch::new();
        hooks.derive(&ctx, &mut batch).unwrap();
        let power = batch.values(&ChannelId::from("storage/power")).unwrap()[0].as_f64().unwrap();
        let expected = stored_energy_j(800.0, 5.0 + 20.0, 20.0) / 60.0;
        assert!((power - expected).abs() < 1e-6);
    }
}
