use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::component::{DeviceHooks, HookContext, WriteBatch};
use crate::domain::{Payload, Timestamp, Value};
use crate::error::ComponentError;

/// On/off device driven through a boolean state channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnableConfig {
    pub state_channel: ChannelId,
    /// Optional analogue setpoint (fan level, rod stage, ...)
    pub setpoint_channel: Option<ChannelId>,
    pub feedback_channel: Option<ChannelId>,
}

pub struct RunnableHooks {
    config: RunnableConfig,
}

impl RunnableHooks {
    pub fn new(config: RunnableConfig) -> Self {
        Self { config }
    }

    /// Setpoints carrying more than on/off go to the setpoint channel
    fn is_analogue(value: &Value) -> bool {
        !matches!(value.payload, Payload::Bool(_))
    }
}

impl DeviceHooks for RunnableHooks {
    fn stop_value(&self) -> Payload {
        Payload::Bool(false)
    }

    fn on_start(
        &self,
        _ctx: &HookContext<'_>,
        batch: &mut WriteBatch,
        at: Timestamp,
        setpoint: Option<&Value>,
    ) -> Result<(), ComponentError> {
        batch.push(&self.config.state_channel, Value::bool(at, true));
        if let (Some(channel), Some(value)) = (&self.config.setpoint_channel, setpoint) {
            if Self::is_analogue(value) {
                batch.push(channel, value.at(at));
            }
        }
        Ok(())
    }

    fn on_stop(&self, _ctx: &HookContext<'_>, batch: &mut WriteBatch, at: Timestamp) -> Result<(), ComponentError> {
        batch.push(&self.config.state_channel, Value::bool(at, false));
        Ok(())
    }

    fn on_set(&self, ctx: &HookContext<'_>, batch: &mut WriteBatch, value: &Value) -> Result<(), ComponentError> {
        match &self.config.setpoint_channel {
            Some(channel) if Self::is_analogue(value) => batch.push(channel, value.clone()),
            _ => {
                let on = value
                    .as_bool()
                    .ok_or_else(|| ComponentError::unsupported(ctx.id, format!("setpoint {value}")))?;
                batch.push(&self.config.state_channel, Value::bool(value.timestamp, on));
            }
        }
        Ok(())
    }

    fn feedback_channel(&self) -> Option<&ChannelId> {
        self.config.feedback_channel.as_ref()
    }
}
