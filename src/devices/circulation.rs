use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::component::{Component, ComponentEvent, ComponentListener};
use crate::domain::RunState;
use crate::error::ComponentError;

/// Follow-up attempts after the pump reported its debounce window open
const MAX_RETRIES: u32 = 5;

/// Keeps a circulation pump running whenever its heat source runs.
///
/// Registered as a listener on the heat source; the pump is started and
/// stopped with `enforced` set, since hydraulics must follow the source.
/// When the pump is still debouncing an earlier write, the follower waits the
/// window out and catches up with whatever state the source is in by then.
pub struct CirculationPumpFollower {
    source: Weak<Component>,
    pump: Weak<Component>,
}

impl CirculationPumpFollower {
    pub fn new(source: &Arc<Component>, pump: &Arc<Component>) -> Self {
        Self {
            source: Arc::downgrade(source),
            pump: Arc::downgrade(pump),
        }
    }

    /// Register on `source`; returns false if this pump already follows it
    pub fn attach(source: &Arc<Component>, pump: &Arc<Component>) -> Arc<Self> {
        let follower = Arc::new(Self::new(source, pump));
        if !source.add_listener(follower.clone()) {
            debug!(source = source.id(), pump = pump.id(), "pump already follows source");
        }
        follower
    }

    fn retry_later(&self, remaining_ms: i64) {
        let source = self.source.clone();
        let pump = self.pump.clone();
        tokio::spawn(async move {
            let mut wait_ms = remaining_ms;
            for attempt in 1..=MAX_RETRIES {
                let wait = u64::try_from(wait_ms).unwrap_or(0).max(1);
                tokio::time::sleep(Duration::from_millis(wait)).await;
                let (Some(source), Some(pump)) = (source.upgrade(), pump.upgrade()) else {
                    return;
                };
                let state = source.run_state().await;
                match follow(&pump, state).await {
                    Ok(()) => {
                        debug!(source = source.id(), pump = pump.id(), attempt, "pump caught up with heat source");
                        return;
                    }
                    Err(ComponentError::Busy { remaining_ms, .. }) => wait_ms = remaining_ms,
                    Err(e) => {
                        warn!(source = source.id(), pump = pump.id(), error = %e, "pump could not follow heat source");
                        return;
                    }
                }
            }
            if let Some(pump) = pump.upgrade() {
                warn!(pump = pump.id(), attempts = MAX_RETRIES, "pump still busy, giving up");
            }
        });
    }
}

async fn follow(pump: &Component, source_state: RunState) -> Result<(), ComponentError> {
    match source_state {
        RunState::Starting | RunState::Running => pump.start_with(None, true).await,
        RunState::Stopping | RunState::Standby => pump.stop_with(true).await,
        RunState::Disabled => Ok(()),
    }
}

#[async_trait]
impl ComponentListener for CirculationPumpFollower {
    async fn on_event(&self, event: &ComponentEvent) -> anyhow::Result<()> {
        let ComponentEvent::StateChanged { component, to, .. } = event else {
            return Ok(());
        };
        let Some(pump) = self.pump.upgrade() else {
            return Ok(());
        };
        debug!(source = %component, pump = pump.id(), state = %to, "heat source changed state");
        match follow(&pump, *to).await {
            Err(ComponentError::Busy { remaining_ms, .. }) => {
                debug!(source = %component, pump = pump.id(), remaining_ms, "pump busy, retrying");
                self.retry_later(remaining_ms);
                Ok(())
            }
            result => Ok(result?),
        }
    }
}
