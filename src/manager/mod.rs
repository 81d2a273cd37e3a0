//! # Energy manager
//!
//! Owns the live component set and runs the orchestration loop. Each cycle:
//!
//! 1. activates components bound since the last cycle;
//! 2. forces the global status (maintenance or enabled) onto every component;
//! 3. applies the current schedule bundle to every schedulable component that
//!    has not accepted it yet;
//! 4. runs all self-checks concurrently.
//!
//! The loop sleeps for `cycle_interval_ms` and is woken early by bind/unbind,
//! a new bundle or a maintenance change. Per-component errors are logged and
//! never stop the loop.

pub mod registry;

pub use registry::ComponentRegistry;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::Component;
use crate::config::ManagerConfig;
use crate::domain::{Capability, ComponentStatus, ScheduleBundle, Timestamp};
use crate::error::ManagerError;

/// Outcome of one orchestration cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub activated: usize,
    pub scheduled: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// Running totals over all cycles
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub failures: u64,
}

pub struct EnergyManager {
    config: ManagerConfig,
    registry: ComponentRegistry,
    pending: Mutex<Vec<Arc<Component>>>,
    bundle: RwLock<Option<Arc<ScheduleBundle>>>,
    /// Bundle timestamp each component last accepted
    applied: Mutex<HashMap<String, Timestamp>>,
    maintenance: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
    stats: Mutex<CycleStats>,
}

impl EnergyManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            registry: ComponentRegistry::new(),
            pending: Mutex::new(Vec::new()),
            bundle: RwLock::new(None),
            applied: Mutex::new(HashMap::new()),
            maintenance: AtomicBool::new(false),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            stats: Mutex::new(CycleStats::default()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Queue a component; it is activated on the next cycle
    pub fn bind(&self, component: Arc<Component>) -> Result<(), ManagerError> {
        {
            let mut pending = self.pending.lock();
            if self.registry.contains(component.id()) || pending.iter().any(|c| c.id() == component.id()) {
                return Err(ManagerError::DuplicateComponent(component.id().to_string()));
            }
            debug!(component = component.id(), "component queued for activation");
            pending.push(component);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Remove and deactivate; the id is reusable once this returns
    pub fn unbind(&self, id: &str) -> Result<Arc<Component>, ManagerError> {
        let component = match self.registry.unregister(id) {
            Some(component) => component,
            None => {
                let mut pending = self.pending.lock();
                let index = pending
                    .iter()
                    .position(|c| c.id() == id)
                    .ok_or_else(|| ManagerError::UnknownComponent(id.to_string()))?;
                pending.remove(index)
            }
        };
        component.deactivate();
        self.applied.lock().remove(id);
        info!(component = id, "component unbound");
        self.wake.notify_one();
        Ok(component)
    }

    /// Unbind everything, live and pending
    pub fn unbind_all(&self) {
        let pending: Vec<String> = self.pending.lock().iter().map(|c| c.id().to_string()).collect();
        let live = self.registry.snapshot().into_iter().map(|c| c.id().to_string());
        for id in live.chain(pending) {
            if let Err(e) = self.unbind(&id) {
                debug!(component = %id, error = %e, "already gone");
            }
        }
    }

    pub fn component(&self, id: &str) -> Option<Arc<Component>> {
        self.registry.get(id)
    }

    pub fn components(&self) -> Vec<Arc<Component>> {
        self.registry.snapshot()
    }

    /// Replace the bundle if `bundle` is strictly newer; returns whether it was taken
    pub fn set_schedule(&self, bundle: ScheduleBundle) -> bool {
        {
            let mut current = self.bundle.write();
            if let Some(existing) = current.as_ref() {
                if !bundle.is_newer_than(existing) {
                    debug!(bundle = %bundle.id, timestamp = %bundle.timestamp, "stale schedule bundle ignored");
                    return false;
                }
            }
            info!(
                bundle = %bundle.id,
                timestamp = %bundle.timestamp,
                components = bundle.schedules.len(),
                "schedule bundle accepted"
            );
            *current = Some(Arc::new(bundle));
        }
        self.wake.notify_one();
        true
    }

    pub fn current_schedule(&self) -> Option<Arc<ScheduleBundle>> {
        self.bundle.read().clone()
    }

    pub fn set_maintenance(&self, enabled: bool) {
        if self.maintenance.swap(enabled, Ordering::SeqCst) != enabled {
            info!(maintenance = enabled, "maintenance mode changed");
            self.apply_status(&self.registry.snapshot());
            self.wake.notify_one();
        }
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    /// Wake the loop now
    pub fn interrupt(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> CycleStats {
        self.stats.lock().clone()
    }

    /// Loop until [`shutdown`](EnergyManager::shutdown)
    pub async fn run(&self) {
        info!(cycle_interval_ms = self.config.cycle_interval_ms, "energy manager started");
        while !self.cancel.is_cancelled() {
            self.run_cycle().await;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => debug!("cycle woken early"),
                _ = tokio::time::sleep(self.config.cycle_interval()) => {}
            }
        }
        info!("energy manager stopped");
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport {
            activated: self.activate_pending(),
            ..CycleReport::default()
        };
        let components = self.registry.snapshot();
        self.apply_status(&components);
        self.apply_schedule(&components, &mut report).await;
        report.failed += self.self_check(&components).await;

        {
            let mut stats = self.stats.lock();
            stats.cycles += 1;
            stats.last_run = Some(Utc::now());
            stats.failures += report.failed as u64;
        }
        debug!(
            components = components.len(),
            activated = report.activated,
            scheduled = report.scheduled,
            deferred = report.deferred,
            failed = report.failed,
            "cycle finished"
        );
        report
    }

    fn activate_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut activated = 0;
        for component in pending {
            component.activate();
            match self.registry.register(component.clone()) {
                Ok(()) => {
                    info!(component = component.id(), component_type = %component.component_type(), "component bound");
                    activated += 1;
                }
                Err(e) => {
                    error!(component = component.id(), error = %e, "activation failed");
                    component.deactivate();
                }
            }
        }
        activated
    }

    fn apply_status(&self, components: &[Arc<Component>]) {
        let status = if self.is_maintenance() {
            ComponentStatus::Maintenance
        } else {
            ComponentStatus::Enabled
        };
        for component in components {
            component.set_status(status);
        }
    }

    async fn apply_schedule(&self, components: &[Arc<Component>], report: &mut CycleReport) {
        let Some(bundle) = self.current_schedule() else {
            return;
        };
        for component in components {
            let Some(schedule) = bundle.get(component.id()) else {
                continue;
            };
            if !component.supports(Capability::Schedulable) {
                debug!(component = component.id(), "not schedulable, schedule ignored");
                continue;
            }
            let already = self
                .applied
                .lock()
                .get(component.id())
                .is_some_and(|t| *t >= bundle.timestamp);
            if already {
                continue;
            }
            match component.schedule(schedule).await {
                Ok(()) => {
                    self.mark_applied(component, bundle.timestamp);
                    report.scheduled += 1;
                }
                Err(e) if e.is_retryable() => {
                    debug!(component = component.id(), error = %e, "schedule deferred to next cycle");
                    report.deferred += 1;
                }
                Err(e) => {
                    warn!(component = component.id(), error = %e, "schedule rejected");
                    self.mark_applied(component, bundle.timestamp);
                    report.failed += 1;
                }
            }
        }
    }

    /// Record the bundle against `component` only while it is still the one
    /// bound under its id; a replacement bound meanwhile gets the bundle fresh.
    fn mark_applied(&self, component: &Arc<Component>, timestamp: Timestamp) {
        let mut applied = self.applied.lock();
        let bound = self
            .registry
            .get(component.id())
            .is_some_and(|current| Arc::ptr_eq(&current, component));
        if bound {
            applied.insert(component.id().to_string(), timestamp);
        } else {
            debug!(component = component.id(), "unbound during scheduling, bundle not recorded");
        }
    }

    async fn self_check(&self, components: &[Arc<Component>]) -> usize {
        let results = join_all(
            components
                .iter()
                .map(|c| async move { (c.id(), c.interrupt().await) }),
        )
        .await;
        let mut failed = 0;
        for (id, result) in results {
            if let Err(e) = result {
                warn!(component = id, error = %e, "self-check failed");
                failed += 1;
            }
        }
        failed
    }
}
