use serde::{Deserialize, Serialize};

use crate::channel::{read_or_default, ChannelId};
use crate::component::{DeviceHooks, HookContext, WriteBatch};
use crate::domain::{Payload, Timestamp, Value};
use crate::error::ComponentError;

/// Power-setpoint device (inverter, storage, EV, CHP, heat pump)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub setpoint_channel: ChannelId,
    /// Written by `start()` without a value
    pub default_power_w: f64,
    /// Measured power; |P| above the threshold counts as running
    pub feedback_channel: Option<ChannelId>,
    pub on_threshold_w: f64,
    /// Upper bound for setpoints, read at write time
    pub power_limit_channel: Option<ChannelId>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            setpoint_channel: ChannelId::from("generator/power_setpoint"),
            default_power_w: 1_000.0,
            feedback_channel: None,
            on_threshold_w: 10.0,
            power_limit_channel: None,
        }
    }
}

pub struct GeneratorHooks {
    config: GeneratorConfig,
}

impl GeneratorHooks {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Clamp to the current power limit. An unreadable limit (INFO/WARNING)
    /// means no limit; a hard read failure aborts the write.
    fn limited(&self, ctx: &HookContext<'_>, value: Value) -> Result<Value, ComponentError> {
        let Some(channel) = &self.config.power_limit_channel else {
            return Ok(value);
        };
        let limit = read_or_default(ctx.store, channel, Value::empty(ctx.now))?;
        let (Some(limit), Some(power)) = (limit.as_f64().filter(|l| !l.is_nan()), value.as_f64()) else {
            return Ok(value);
        };
        let limit = limit.abs();
        if power.abs() <= limit {
            return Ok(value);
        }
        tracing::debug!(component = ctx.id, power_w = power, limit_w = limit, "setpoint clamped to power limit");
        Ok(Value::double(value.timestamp, limit.copysign(power)))
    }
}

impl DeviceHooks for GeneratorHooks {
    fn stop_value(&self) -> Payload {
        Payload::Double(0.0)
    }

    fn on_start(
        &self,
        ctx: &HookContext<'_>,
        batch: &mut WriteBatch,
        at: Timestamp,
        setpoint: Option<&Value>,
    ) -> Result<(), ComponentError> {
        let value = match setpoint {
            Some(v) => v.at(at),
            None => Value::double(at, self.config.default_power_w),
        };
        batch.push(&self.config.setpoint_channel, self.limited(ctx, value)?);
        Ok(())
    }

    fn on_stop(&self, _ctx: &HookContext<'_>, batch: &mut WriteBatch, at: Timestamp) -> Result<(), ComponentError> {
        batch.push(&self.config.setpoint_channel, Value::double(at, 0.0));
        Ok(())
    }

    fn on_set(&self, ctx: &HookContext<'_>, batch: &mut WriteBatch, value: &Value) -> Result<(), ComponentError> {
        batch.push(&self.config.setpoint_channel, self.limited(ctx, value.clone())?);
        Ok(())
    }

    fn feedback_channel(&self) -> Option<&ChannelId> {
        self.config.feedback_channel.as_ref()
    }

    fn decode_feedback(&self, value: &Value) -> Option<bool> {
        value
            .as_f64()
            .filter(|p| !p.is_nan())
            .map(|p| p.abs() > self.config.on_threshold_w)
    }
}
