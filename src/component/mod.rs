//! # Component
//!
//! One managed device: a [`RunStateMachine`], a [`TimingGuard`] and an
//! [`EventDispatcher`] wired to device-specific [`DeviceHooks`] that decide
//! what to write.
//!
//! Every action runs on the component's write lane (an async mutex held
//! across emission), so concurrent `start`/`stop`/`set`/`schedule` calls on
//! the same component never interleave their batches. Events produced by an
//! action are dispatched after the lane is released; listeners may call back
//! into the component (or deactivate it) without deadlocking.

pub mod batch;
pub mod compiler;
pub mod events;
pub mod guard;
pub mod state;

pub use batch::{EmitError, WriteBatch};
pub use compiler::{ActionKind, CompiledAction, CompiledSchedule, ScheduleCompiler, SkipReason};
pub use events::{ComponentEvent, ComponentListener, EventDispatcher};
pub use guard::{GuardConfig, GuardTimes, TimingGuard};
pub use state::{RunStateMachine, SetRoute, Transition};

use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::{ChannelId, ChannelStore, ValueListener};
use crate::domain::{
    Capability, CapabilitySet, Clock, ComponentRecord, ComponentStatus, ComponentType, Payload,
    RunState, Schedule, Timestamp, Value,
};
use crate::error::{Action, ComponentError};

/// What hooks get to see while filling a batch
pub struct HookContext<'a> {
    pub id: &'a str,
    pub store: &'a dyn ChannelStore,
    pub now: Timestamp,
}

/// Device-specific behaviour: what a start, stop or setpoint change writes.
pub trait DeviceHooks: Send + Sync {
    /// Setpoint that means "off"
    fn stop_value(&self) -> Payload;

    fn on_start(
        &self,
        ctx: &HookContext<'_>,
        batch: &mut WriteBatch,
        at: Timestamp,
        setpoint: Option<&Value>,
    ) -> Result<(), ComponentError>;

    fn on_stop(
        &self,
        ctx: &HookContext<'_>,
        batch: &mut WriteBatch,
        at: Timestamp,
    ) -> Result<(), ComponentError>;

    fn on_set(
        &self,
        ctx: &HookContext<'_>,
        batch: &mut WriteBatch,
        value: &Value,
    ) -> Result<(), ComponentError>;

    /// Channel reporting whether the device actually runs
    fn feedback_channel(&self) -> Option<&ChannelId> {
        None
    }

    fn decode_feedback(&self, value: &Value) -> Option<bool> {
        value.as_bool()
    }

    /// Values computed from observations during the self-check
    fn derive(&self, _ctx: &HookContext<'_>, _batch: &mut WriteBatch) -> Result<(), ComponentError> {
        Ok(())
    }

    fn set_island_mode(
        &self,
        ctx: &HookContext<'_>,
        _batch: &mut WriteBatch,
        _enabled: bool,
    ) -> Result<(), ComponentError> {
        Err(ComponentError::unsupported(ctx.id, "island mode"))
    }
}

/// Condition a dependent sub-handler puts on starting and stopping
pub trait Prerequisite: Send + Sync {
    fn name(&self) -> &str;
    fn allows_start(&self) -> bool;
    fn allows_stop(&self) -> bool;

    /// Subscribe to whatever the condition is computed from
    fn attach(self: Arc<Self>) {}

    fn detach(self: Arc<Self>) {}
}

#[derive(Debug, Clone)]
pub struct ComponentSettings {
    pub guard: GuardConfig,
    pub enabled: bool,
    pub write_timeout: Duration,
    pub validation_interval_ms: i64,
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            enabled: true,
            write_timeout: Duration::from_secs(5),
            validation_interval_ms: 60_000,
        }
    }
}

struct Core {
    machine: RunStateMachine,
    guard: TimingGuard,
    /// Scheduled actions queued in the store for later, ascending
    plan: Vec<CompiledAction>,
}

/// Guard times to record once a batch reached the store
#[derive(Debug, Clone, Copy, Default)]
struct Armed {
    write: Option<Timestamp>,
    start: Option<Timestamp>,
    stop: Option<Timestamp>,
}

impl Armed {
    fn write(at: Timestamp) -> Self {
        Self {
            write: Some(at),
            ..Self::default()
        }
    }

    fn start(at: Timestamp) -> Self {
        Self {
            start: Some(at),
            ..Self::write(at)
        }
    }

    fn stop(at: Timestamp) -> Self {
        Self {
            stop: Some(at),
            ..Self::write(at)
        }
    }

    fn apply(self, guard: &mut TimingGuard) {
        if let Some(t) = self.write {
            guard.record_write(t);
        }
        if let Some(t) = self.start {
            guard.record_start(t);
        }
        if let Some(t) = self.stop {
            guard.record_stop(t);
        }
    }
}

fn drive(machine: &mut RunStateMachine, kind: ActionKind) -> Vec<Transition> {
    match kind {
        ActionKind::Start => machine.begin_start(),
        ActionKind::Stop => machine.begin_stop(),
        ActionKind::Set => Vec::new(),
    }
}

/// A new plan supersedes the old one from its first action on, as the store
/// does with queued values
fn replan(plan: &mut Vec<CompiledAction>, future: Vec<CompiledAction>) {
    let Some(cutoff) = future.first().map(CompiledAction::timestamp) else {
        return;
    };
    plan.retain(|a| a.timestamp() < cutoff);
    plan.extend(future);
}

/// Apply planned actions whose time has come: they were written when the
/// schedule was emitted, so only the guard and state catch up here.
fn settle_plan(core: &mut Core, id: &str, now: Timestamp) -> Vec<Transition> {
    let due = core.plan.partition_point(|a| a.timestamp() <= now);
    let mut transitions = Vec::new();
    for action in core.plan.drain(..due).collect::<Vec<_>>() {
        let at = action.timestamp();
        let times = core.guard.times();
        let later = |t: Option<Timestamp>| t.map_or(true, |t| t < at);
        let armed = Armed {
            write: later(times.last_write).then_some(at),
            start: (action.kind == ActionKind::Start && later(times.last_start)).then_some(at),
            stop: (action.kind == ActionKind::Stop && later(times.last_stop)).then_some(at),
        };
        armed.apply(&mut core.guard);
        debug!(component = id, action = %action.kind, at = %at, "planned action fell due");
        transitions.extend(drive(&mut core.machine, action.kind));
    }
    transitions
}

#[derive(Default)]
struct Wiring {
    active: bool,
    cancel: CancellationToken,
    feedback: Option<Arc<dyn ValueListener>>,
}

/// Pushes feedback from the store's notifying thread onto the component's worker
struct FeedbackForwarder {
    tx: mpsc::UnboundedSender<Value>,
}

impl ValueListener for FeedbackForwarder {
    fn on_value(&self, channel: &ChannelId, value: &Value) {
        if self.tx.send(value.clone()).is_err() {
            trace!(channel = %channel, "feedback worker gone, value dropped");
        }
    }
}

pub struct Component {
    id: String,
    component_type: ComponentType,
    capabilities: CapabilitySet,
    hooks: Arc<dyn DeviceHooks>,
    store: Arc<dyn ChannelStore>,
    clock: Arc<dyn Clock>,
    settings: ComponentSettings,
    prerequisites: Vec<Arc<dyn Prerequisite>>,
    core: tokio::sync::Mutex<Core>,
    status: RwLock<ComponentStatus>,
    dispatcher: EventDispatcher,
    wiring: Mutex<Wiring>,
}

impl Component {
    pub fn new(
        id: impl Into<String>,
        component_type: ComponentType,
        capabilities: CapabilitySet,
        hooks: Arc<dyn DeviceHooks>,
        store: Arc<dyn ChannelStore>,
        clock: Arc<dyn Clock>,
        settings: ComponentSettings,
    ) -> Self {
        let id = id.into();
        let machine = RunStateMachine::new(hooks.feedback_channel().is_some(), settings.enabled);
        Self {
            dispatcher: EventDispatcher::new(id.clone()),
            id,
            component_type,
            capabilities,
            hooks,
            store,
            clock,
            core: tokio::sync::Mutex::new(Core {
                machine,
                guard: TimingGuard::new(settings.guard),
                plan: Vec::new(),
            }),
            settings,
            prerequisites: Vec::new(),
            status: RwLock::new(ComponentStatus::Enabled),
            wiring: Mutex::new(Wiring::default()),
        }
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<Arc<dyn Prerequisite>>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn settings(&self) -> &ComponentSettings {
        &self.settings
    }

    pub fn status(&self) -> ComponentStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ComponentStatus) {
        let mut current = self.status.write();
        if *current != status {
            let previous = *current;
            info!(component = %self.id, from = %previous, to = %status, "status changed");
            *current = status;
        }
    }

    pub fn is_active(&self) -> bool {
        self.wiring.lock().active
    }

    pub fn add_listener(&self, listener: Arc<dyn ComponentListener>) -> bool {
        self.dispatcher.register(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ComponentListener>) -> bool {
        self.dispatcher.deregister(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.dispatcher.len()
    }

    pub async fn run_state(&self) -> RunState {
        self.core.lock().await.machine.state()
    }

    pub async fn record(&self) -> ComponentRecord {
        let core = self.core.lock().await;
        let times = core.guard.times();
        ComponentRecord {
            id: self.id.clone(),
            component_type: self.component_type,
            capabilities: self.capabilities,
            run_state: core.machine.state(),
            status: self.status(),
            last_start: times.last_start,
            last_stop: times.last_stop,
            last_write: times.last_write,
        }
    }

    /// Minimum idle time elapsed and, with heating circuits attached, one of them demands heat
    pub async fn is_startable(&self) -> bool {
        let now = self.clock.now();
        let core = self.core.lock().await;
        core.guard.is_startable(core.machine.state(), now)
            && self.check_prerequisites(Action::Start).is_ok()
    }

    pub async fn is_stoppable(&self) -> bool {
        let now = self.clock.now();
        let core = self.core.lock().await;
        core.guard.is_stoppable(core.machine.state(), now)
            && self.check_prerequisites(Action::Stop).is_ok()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Wire feedback and sub-handler subscriptions. Idempotent.
    pub fn activate(self: &Arc<Self>) {
        let mut wiring = self.wiring.lock();
        if wiring.active {
            return;
        }
        wiring.cancel = CancellationToken::new();
        if let Some(channel) = self.hooks.feedback_channel() {
            let (tx, rx) = mpsc::unbounded_channel();
            let forwarder: Arc<dyn ValueListener> = Arc::new(FeedbackForwarder { tx });
            self.store.register_listener(channel, forwarder.clone());
            tokio::spawn(feedback_worker(Arc::downgrade(self), rx, wiring.cancel.clone()));
            wiring.feedback = Some(forwarder);
        }
        for prerequisite in &self.prerequisites {
            prerequisite.clone().attach();
        }
        wiring.active = true;
        info!(
            component = %self.id,
            component_type = %self.component_type,
            capabilities = ?self.capabilities,
            "activated"
        );
    }

    /// Tear down subscriptions and cancel in-flight writes. Idempotent, and
    /// safe to call from inside one of this component's own listeners.
    pub fn deactivate(&self) {
        let forwarder = {
            let mut wiring = self.wiring.lock();
            if !wiring.active {
                return;
            }
            wiring.active = false;
            wiring.cancel.cancel();
            wiring.feedback.take()
        };
        if let (Some(channel), Some(forwarder)) = (self.hooks.feedback_channel(), forwarder) {
            self.store.deregister_listener(channel, &forwarder);
        }
        for prerequisite in &self.prerequisites {
            prerequisite.clone().detach();
        }
        self.dispatcher.clear();
        info!(component = %self.id, "deactivated");
    }

    /// Configuration switched the component on or off
    pub async fn set_enabled(&self, enabled: bool) {
        let now = self.clock.now();
        let events = {
            let mut core = self.core.lock().await;
            let transition = if enabled {
                core.machine.enable()
            } else {
                core.machine.disable()
            };
            self.state_events(transition.into_iter().collect(), now)
        };
        self.dispatch_all(events).await;
    }

    /// Periodic self-check: settle planned actions that have fallen due,
    /// reconcile the modeled state with device feedback, then emit derived
    /// values.
    pub async fn interrupt(&self) -> Result<(), ComponentError> {
        let now = self.clock.now();
        let observed = self.observe_feedback();
        let (events, result) = {
            let mut core = self.core.lock().await;
            let mut transitions = settle_plan(&mut core, &self.id, now);
            if let Some(on) = observed {
                if let Some(t) = core
                    .machine
                    .reconcile(on, now, self.settings.validation_interval_ms)
                {
                    info!(component = %self.id, from = %t.from, to = %t.to, "state reconciled with device feedback");
                    transitions.push(t);
                }
            }
            let mut batch = WriteBatch::new();
            let result = match self.hooks.derive(&self.context(now), &mut batch) {
                Ok(()) => self
                    .emit(&mut core, &batch, Armed::default())
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            (self.state_events(transitions, now), result)
        };
        self.dispatch_all(events).await;
        result
    }

    fn observe_feedback(&self) -> Option<bool> {
        let channel = self.hooks.feedback_channel()?;
        match self.store.latest_value(channel) {
            Ok(value) if value.is_empty() => None,
            Ok(value) => self.hooks.decode_feedback(&value),
            Err(e) => {
                warn!(component = %self.id, error = %e, "feedback unreadable during self-check");
                None
            }
        }
    }

    /// Device feedback arrived on the feedback channel
    pub async fn apply_feedback(&self, value: Value) {
        let Some(channel) = self.hooks.feedback_channel() else {
            return;
        };
        let now = self.clock.now();
        let mut events = vec![ComponentEvent::ValueChanged {
            component: self.id.clone(),
            channel: channel.clone(),
            value: value.clone(),
        }];
        if let Some(on) = self.hooks.decode_feedback(&value) {
            let mut core = self.core.lock().await;
            if let Some(t) = core.machine.on_feedback(on) {
                events.extend(self.state_events(vec![t], now));
            }
        }
        self.dispatch_all(events).await;
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub async fn start(&self) -> Result<(), ComponentError> {
        self.start_with(None, false).await
    }

    pub async fn start_value(&self, value: Value) -> Result<(), ComponentError> {
        self.start_with(Some(value), false).await
    }

    /// Start, optionally with a setpoint. `enforced` bypasses the minimum idle
    /// time and heating prerequisites, never debounce or maintenance.
    pub async fn start_with(&self, setpoint: Option<Value>, enforced: bool) -> Result<(), ComponentError> {
        self.check_actuation(Capability::Runnable, Action::Start)?;
        let (settled, result) = {
            let mut core = self.core.lock().await;
            let now = self.clock.now();
            let settled = self.settle(&mut core, now);
            let result = self.start_action(&mut core, now, setpoint, enforced).await;
            (settled, result)
        };
        self.finish(settled, result).await
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.stop_with(false).await
    }

    /// Stop. `enforced` bypasses the minimum runtime and heating prerequisites.
    pub async fn stop_with(&self, enforced: bool) -> Result<(), ComponentError> {
        self.check_actuation(Capability::Runnable, Action::Stop)?;
        let (settled, result) = {
            let mut core = self.core.lock().await;
            let now = self.clock.now();
            let settled = self.settle(&mut core, now);
            let result = self.stop_action(&mut core, now, enforced).await;
            (settled, result)
        };
        self.finish(settled, result).await
    }

    pub async fn set(&self, value: Value) -> Result<(), ComponentError> {
        self.set_with(value, false).await
    }

    /// Apply a setpoint: starts an idle device, stops a running one on the
    /// stop value, otherwise writes it through.
    pub async fn set_with(&self, value: Value, enforced: bool) -> Result<(), ComponentError> {
        self.check_actuation(Capability::Flexible, Action::Set)?;
        let (settled, result) = {
            let mut core = self.core.lock().await;
            let now = self.clock.now();
            let settled = self.settle(&mut core, now);
            let result = self.set_action(&mut core, now, value, enforced).await;
            (settled, result)
        };
        self.finish(settled, result).await
    }

    /// Compile `schedule` and emit it as one batch. Future-dated values are
    /// queued by the channel store and kept as the component's plan; they
    /// drive the state and guard only once they fall due.
    pub async fn schedule(&self, schedule: &Schedule) -> Result<(), ComponentError> {
        self.check_actuation(Capability::Schedulable, Action::Schedule)?;
        let (settled, result) = {
            let mut core = self.core.lock().await;
            let now = self.clock.now();
            let settled = self.settle(&mut core, now);
            let result = self.schedule_locked(&mut core, now, schedule).await;
            (settled, result)
        };
        self.finish(settled, result).await
    }

    pub async fn set_island_mode(&self, enabled: bool) -> Result<(), ComponentError> {
        if self.status() == ComponentStatus::Maintenance {
            return Err(ComponentError::MaintenanceActive { id: self.id.clone() });
        }
        let mut core = self.core.lock().await;
        let now = self.clock.now();
        self.check_enabled(&core)?;
        let mut batch = WriteBatch::new();
        self.hooks
            .set_island_mode(&self.context(now), &mut batch, enabled)?;
        self.check_ready(&core, now)?;
        self.emit(&mut core, &batch, Armed::write(now)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write lane internals (caller holds the core lock)
    // ------------------------------------------------------------------

    async fn start_action(
        &self,
        core: &mut Core,
        now: Timestamp,
        setpoint: Option<Value>,
        enforced: bool,
    ) -> Result<Vec<ComponentEvent>, ComponentError> {
        self.check_enabled(core)?;
        let setpoint = setpoint.map(|v| v.at(now));
        match (core.machine.state().is_active(), setpoint) {
            (true, Some(value)) => {
                self.write_locked(core, now, &value).await?;
                Ok(Vec::new())
            }
            (true, None) => {
                debug!(component = %self.id, "start ignored: already running");
                Ok(Vec::new())
            }
            (false, setpoint) => {
                self.start_locked(core, now, setpoint.as_ref(), enforced)
                    .await
            }
        }
    }

    async fn stop_action(
        &self,
        core: &mut Core,
        now: Timestamp,
        enforced: bool,
    ) -> Result<Vec<ComponentEvent>, ComponentError> {
        self.check_enabled(core)?;
        if core.machine.state().is_idle() {
            debug!(component = %self.id, "stop ignored: not running");
            return Ok(Vec::new());
        }
        self.stop_locked(core, now, enforced).await
    }

    async fn set_action(
        &self,
        core: &mut Core,
        now: Timestamp,
        value: Value,
        enforced: bool,
    ) -> Result<Vec<ComponentEvent>, ComponentError> {
        self.check_enabled(core)?;
        let value = value.at(now);
        let is_stop = value.payload.same_setpoint(&self.hooks.stop_value());
        match core.machine.route_set(is_stop) {
            SetRoute::Start => self.start_locked(core, now, Some(&value), enforced).await,
            SetRoute::Stop => self.stop_locked(core, now, enforced).await,
            SetRoute::Write => {
                self.write_locked(core, now, &value).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn schedule_locked(
        &self,
        core: &mut Core,
        now: Timestamp,
        schedule: &Schedule,
    ) -> Result<Vec<ComponentEvent>, ComponentError> {
        self.check_enabled(core)?;
        self.check_ready(core, now)?;

        let compiler = ScheduleCompiler::new(self.hooks.stop_value(), core.guard.config().min_runtime_ms);
        let compiled = compiler.compile(schedule, core.guard.times().last_start);
        if compiled.is_empty() {
            debug!(component = %self.id, entries = schedule.len(), "schedule compiled to nothing");
            return Ok(Vec::new());
        }

        let ctx = self.context(now);
        let mut batch = WriteBatch::new();
        for action in &compiled.actions {
            match action.kind {
                ActionKind::Start => {
                    self.hooks
                        .on_start(&ctx, &mut batch, action.timestamp(), Some(&action.value))?
                }
                ActionKind::Stop => self.hooks.on_stop(&ctx, &mut batch, action.timestamp())?,
                ActionKind::Set => self.hooks.on_set(&ctx, &mut batch, &action.value)?,
            }
        }
        let armed = Armed {
            write: batch.last_timestamp().map(|t| t.min(now)),
            start: compiled.last_due(ActionKind::Start, now),
            stop: compiled.last_due(ActionKind::Stop, now),
        };
        if !self.emit(core, &batch, armed).await? {
            return Ok(Vec::new());
        }

        let mut transitions = Vec::new();
        let (due, future): (Vec<_>, Vec<_>) = compiled
            .actions
            .iter()
            .cloned()
            .partition(|a| a.timestamp() <= now);
        for action in &due {
            transitions.extend(drive(&mut core.machine, action.kind));
        }
        replan(&mut core.plan, future);
        info!(
            component = %self.id,
            actions = compiled.actions.len(),
            planned = core.plan.len(),
            skipped = compiled.skipped.len(),
            "schedule applied"
        );
        Ok(self.state_events(transitions, now))
    }

    async fn start_locked(
        &self,
        core: &mut Core,
        now: Timestamp,
        setpoint: Option<&Value>,
        enforced: bool,
    ) -> Result<Vec<ComponentEvent>, ComponentError> {
        self.check_ready(core, now)?;
        if !enforced {
            let remaining_ms = core.guard.startable_in(core.machine.state(), now);
            if remaining_ms > 0 {
                return Err(ComponentError::IntervalViolation {
                    id: self.id.clone(),
                    action: Action::Start,
                    remaining_ms,
                });
            }
            self.check_prerequisites(Action::Start)?;
        }
        let mut batch = WriteBatch::new();
        self.hooks
            .on_start(&self.context(now), &mut batch, now, setpoint)?;
        self.emit(core, &batch, Armed::start(now)).await?;
        info!(component = %self.id, enforced, "started");
        Ok(self.state_events(core.machine.begin_start(), now))
    }

    async fn stop_locked(
        &self,
        core: &mut Core,
        now: Timestamp,
        enforced: bool,
    ) -> Result<Vec<ComponentEvent>, ComponentError> {
        self.check_ready(core, now)?;
        if !enforced {
            let remaining_ms = core.guard.stoppable_in(core.machine.state(), now);
            if remaining_ms > 0 {
                return Err(ComponentError::IntervalViolation {
                    id: self.id.clone(),
                    action: Action::Stop,
                    remaining_ms,
                });
            }
            self.check_prerequisites(Action::Stop)?;
        }
        let mut batch = WriteBatch::new();
        self.hooks.on_stop(&self.context(now), &mut batch, now)?;
        self.emit(core, &batch, Armed::stop(now)).await?;
        info!(component = %self.id, enforced, "stopped");
        Ok(self.state_events(core.machine.begin_stop(), now))
    }

    async fn write_locked(&self, core: &mut Core, now: Timestamp, value: &Value) -> Result<(), ComponentError> {
        self.check_ready(core, now)?;
        let mut batch = WriteBatch::new();
        self.hooks.on_set(&self.context(now), &mut batch, value)?;
        self.emit(core, &batch, Armed::write(now)).await?;
        debug!(component = %self.id, value = %value, "setpoint written");
        Ok(())
    }

    /// Emit within the write timeout and arm the guard once anything reached
    /// the store. A channel failure after earlier channels were written still
    /// arms it, since the device may already have switched. Timeout and
    /// cancellation leave the guard untouched. Returns whether anything was
    /// written.
    async fn emit(&self, core: &mut Core, batch: &WriteBatch, armed: Armed) -> Result<bool, ComponentError> {
        if batch.is_empty() {
            return Ok(false);
        }
        let cancel = self.wiring.lock().cancel.clone();
        let timeout = self.settings.write_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(component = %self.id, "write cancelled");
                Err(ComponentError::Cancelled { id: self.id.clone() })
            }
            result = tokio::time::timeout(timeout, batch.emit(self.store.as_ref())) => match result {
                Ok(Ok(())) => {
                    trace!(component = %self.id, values = batch.len(), "batch emitted");
                    armed.apply(&mut core.guard);
                    Ok(true)
                }
                Ok(Err(e)) => {
                    if e.is_partial() {
                        warn!(component = %self.id, written = e.written, total = e.total, error = %e.source, "batch partially written, guard armed");
                        armed.apply(&mut core.guard);
                    }
                    Err(e.source.into())
                }
                Err(_) => {
                    let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                    warn!(component = %self.id, after_ms, "write not acknowledged in time");
                    Err(ComponentError::Timeout { id: self.id.clone(), after_ms })
                }
            }
        }
    }

    fn settle(&self, core: &mut Core, now: Timestamp) -> Vec<ComponentEvent> {
        let transitions = settle_plan(core, &self.id, now);
        self.state_events(transitions, now)
    }

    /// Events from settled plan actions go out even when the action itself fails
    async fn finish(
        &self,
        settled: Vec<ComponentEvent>,
        result: Result<Vec<ComponentEvent>, ComponentError>,
    ) -> Result<(), ComponentError> {
        self.dispatch_all(settled).await;
        self.dispatch_all(result?).await;
        Ok(())
    }

    fn context(&self, now: Timestamp) -> HookContext<'_> {
        HookContext {
            id: &self.id,
            store: self.store.as_ref(),
            now,
        }
    }

    fn check_actuation(&self, capability: Capability, action: Action) -> Result<(), ComponentError> {
        if self.status() == ComponentStatus::Maintenance {
            debug!(component = %self.id, %action, "rejected: maintenance");
            return Err(ComponentError::MaintenanceActive { id: self.id.clone() });
        }
        if !self.capabilities.contains(capability) {
            return Err(ComponentError::unsupported(&self.id, action.to_string()));
        }
        Ok(())
    }

    fn check_enabled(&self, core: &Core) -> Result<(), ComponentError> {
        if core.machine.state() == RunState::Disabled {
            return Err(ComponentError::Disabled { id: self.id.clone() });
        }
        Ok(())
    }

    fn check_ready(&self, core: &Core, now: Timestamp) -> Result<(), ComponentError> {
        let remaining_ms = core.guard.ready_in(now);
        if remaining_ms > 0 {
            debug!(component = %self.id, remaining_ms, "busy: debounce window still open");
            return Err(ComponentError::Busy {
                id: self.id.clone(),
                remaining_ms,
            });
        }
        Ok(())
    }

    fn check_prerequisites(&self, action: Action) -> Result<(), ComponentError> {
        if self.prerequisites.is_empty() {
            return Ok(());
        }
        let reason = match action {
            Action::Start if !self.prerequisites.iter().any(|p| p.allows_start()) => {
                Some("no heating circuit demands heat".to_string())
            }
            Action::Stop => self
                .prerequisites
                .iter()
                .find(|p| !p.allows_stop())
                .map(|p| format!("{} has not reached its target", p.name())),
            _ => None,
        };
        match reason {
            Some(reason) => Err(ComponentError::PrerequisiteNotMet {
                id: self.id.clone(),
                action,
                reason,
            }),
            None => Ok(()),
        }
    }

    fn state_events(&self, transitions: Vec<Transition>, at: Timestamp) -> Vec<ComponentEvent> {
        transitions
            .into_iter()
            .map(|t| {
                debug!(component = %self.id, from = %t.from, to = %t.to, "state transition");
                ComponentEvent::StateChanged {
                    component: self.id.clone(),
                    from: t.from,
                    to: t.to,
                    at,
                }
            })
            .collect()
    }

    async fn dispatch_all(&self, events: Vec<ComponentEvent>) {
        for event in &events {
            self.dispatcher.dispatch(event).await;
        }
    }
}

async fn feedback_worker(
    component: Weak<Component>,
    mut rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            value = rx.recv() => match value {
                Some(value) => value,
                None => break,
            },
        };
        let Some(component) = component.upgrade() else {
            break;
        };
        component.apply_feedback(value).await;
    }
    trace!("feedback worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannelStore;
    use crate::domain::ManualClock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const MIN_RUNTIME: i64 = 600_000;
    const MIN_IDLE: i64 = 300_000;
    const DEBOUNCE: i64 = 1_000;

    /// Power setpoint device: stop writes 0, optional feedback
    struct PowerHooks {
        power: ChannelId,
        feedback: Option<ChannelId>,
    }

    impl DeviceHooks for PowerHooks {
        fn stop_value(&self) -> Payload {
            Payload::Double(0.0)
        }

        fn on_start(
            &self,
            _ctx: &HookContext<'_>,
            batch: &mut WriteBatch,
            at: Timestamp,
            setpoint: Option<&Value>,
        ) -> Result<(), ComponentError> {
            let value = setpoint.cloned().unwrap_or_else(|| Value::double(at, 1_000.0));
            batch.push(&self.power, value.at(at));
            Ok(())
        }

        fn on_stop(&self, _ctx: &HookContext<'_>, batch: &mut WriteBatch, at: Timestamp) -> Result<(), ComponentError> {
            batch.push(&self.power, Value::double(at, 0.0));
            Ok(())
        }

        fn on_set(&self, _ctx: &HookContext<'_>, batch: &mut WriteBatch, value: &Value) -> Result<(), ComponentError> {
            batch.push(&self.power, value.clone());
            Ok(())
        }

        fn feedback_channel(&self) -> Option<&ChannelId> {
            self.feedback.as_ref()
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryChannelStore>,
        component: Arc<Component>,
    }

    fn fixture_with(feedback: bool, settings: ComponentSettings) -> Fixture {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let store = Arc::new(MemoryChannelStore::new(clock.clone()));
        let hooks = Arc::new(PowerHooks {
            power: ChannelId::from("hp1/power"),
            feedback: feedback.then(|| ChannelId::from("hp1/running")),
        });
        let component = Arc::new(Component::new(
            "hp1",
            ComponentType::HeatPump,
            CapabilitySet::empty()
                .with(Capability::Runnable)
                .with(Capability::Schedulable)
                .with(Capability::Flexible),
            hooks,
            store.clone(),
            clock.clone(),
            settings,
        ));
        component.activate();
        Fixture {
            clock,
            store,
            component,
        }
    }

    fn settings() -> ComponentSettings {
        ComponentSettings {
            guard: GuardConfig {
                min_runtime_ms: MIN_RUNTIME,
                min_idle_ms: MIN_IDLE,
                write_debounce_ms: DEBOUNCE,
            },
            ..ComponentSettings::default()
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false, settings())
    }

    async fn wait_for(component: &Component, state: RunState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while component.run_state().await != state {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("state not reached");
    }

    #[tokio::test]
    async fn test_stop_respects_min_runtime() {
        let f = fixture();
        f.component.start().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Running);

        f.clock.set(Timestamp(100_000));
        let err = f.component.stop().await.unwrap_err();
        assert!(matches!(
            err,
            ComponentError::IntervalViolation { action: Action::Stop, remaining_ms: 500_000, .. }
        ));

        f.clock.set(Timestamp(MIN_RUNTIME));
        f.component.stop().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Standby);
    }

    #[tokio::test]
    async fn test_enforced_stop_bypasses_min_runtime() {
        let f = fixture();
        f.component.start().await.unwrap();
        f.clock.set(Timestamp(5_000));
        f.component.stop_with(true).await.unwrap();
        assert_eq!(f.component.record().await.last_stop, Some(Timestamp(5_000)));
    }

    #[tokio::test]
    async fn test_debounced_write_touches_nothing() {
        let f = fixture();
        f.component.start().await.unwrap();
        let before = f.component.record().await;
        let writes = f.store.writes().len();

        f.clock.set(Timestamp(500));
        let err = f.component.set(Value::double(Timestamp(500), 2_000.0)).await.unwrap_err();
        assert!(matches!(err, ComponentError::Busy { remaining_ms: 500, .. }));
        assert_eq!(f.component.record().await, before);
        assert_eq!(f.store.writes().len(), writes);
    }

    #[tokio::test]
    async fn test_start_while_running() {
        let f = fixture();
        f.component.start().await.unwrap();
        f.clock.set(Timestamp(10_000));
        f.component.start().await.unwrap();
        assert_eq!(f.store.writes().len(), 1);

        f.component
            .start_value(Value::double(Timestamp(0), 3_000.0))
            .await
            .unwrap();
        let writes = f.store.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].values[0], Value::double(Timestamp(10_000), 3_000.0));
        // a plain write does not restart the runtime window
        assert_eq!(f.component.record().await.last_start, Some(Timestamp(0)));
    }

    #[tokio::test]
    async fn test_set_routes_by_state() {
        let f = fixture();
        f.component.set(Value::double(Timestamp(0), 2_000.0)).await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Running);

        f.clock.set(Timestamp(MIN_RUNTIME + 1));
        f.component.set(Value::int(Timestamp(0), 0)).await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Standby);

        f.clock.set(Timestamp(MIN_RUNTIME + 100_000));
        let err = f.component.set(Value::double(Timestamp(0), 1.0)).await.unwrap_err();
        assert!(matches!(err, ComponentError::IntervalViolation { action: Action::Start, .. }));
    }

    #[tokio::test]
    async fn test_maintenance_blocks_actuation() {
        let f = fixture();
        f.component.set_status(ComponentStatus::Maintenance);
        assert!(matches!(
            f.component.start().await,
            Err(ComponentError::MaintenanceActive { .. })
        ));
        assert!(f.store.writes().is_empty());

        f.component.set_status(ComponentStatus::Enabled);
        f.component.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_capability_is_unsupported() {
        let f = fixture();
        assert!(matches!(
            f.component.set_island_mode(true).await,
            Err(ComponentError::Unsupported { .. })
        ));

        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let store = Arc::new(MemoryChannelStore::new(clock.clone()));
        let readonly = Component::new(
            "buffer",
            ComponentType::ThermalStorage,
            CapabilitySet::empty().with(Capability::Heating),
            Arc::new(PowerHooks {
                power: ChannelId::from("x"),
                feedback: None,
            }),
            store,
            clock,
            ComponentSettings::default(),
        );
        assert!(matches!(readonly.start().await, Err(ComponentError::Unsupported { .. })));
        assert!(matches!(
            readonly.schedule(&Schedule::default()).await,
            Err(ComponentError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_disabled_rejects_everything() {
        let f = fixture_with(
            false,
            ComponentSettings {
                enabled: false,
                ..settings()
            },
        );
        assert_eq!(f.component.run_state().await, RunState::Disabled);
        assert!(matches!(f.component.start().await, Err(ComponentError::Disabled { .. })));
        assert!(matches!(f.component.stop().await, Err(ComponentError::Disabled { .. })));

        f.component.set_enabled(true).await;
        f.component.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_timeout_leaves_guard_unchanged() {
        let f = fixture_with(
            false,
            ComponentSettings {
                write_timeout: Duration::from_millis(20),
                ..settings()
            },
        );
        f.store.set_write_delay(Some(Duration::from_millis(500)));
        let err = f.component.start().await.unwrap_err();
        assert!(matches!(err, ComponentError::Timeout { after_ms: 20, .. }));
        let record = f.component.record().await;
        assert_eq!(record.last_write, None);
        assert_eq!(record.run_state, RunState::Standby);

        f.store.set_write_delay(None);
        f.component.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivate_cancels_writes() {
        let f = fixture();
        f.component.deactivate();
        f.component.deactivate();
        assert!(!f.component.is_active());
        assert!(matches!(f.component.start().await, Err(ComponentError::Cancelled { .. })));
        assert!(f.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_emits_one_batch() {
        let f = fixture();
        f.clock.set(Timestamp(1_000));
        let schedule: Schedule = vec![
            Value::double(Timestamp(1_000), 5.0),
            Value::double(Timestamp(2_000_000), 5.0),
            Value::double(Timestamp(3_000_000), 7.0),
            Value::double(Timestamp(4_000_000), 0.0),
        ]
        .into_iter()
        .collect();
        f.component.schedule(&schedule).await.unwrap();

        let writes = f.store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].values.len(), 3);
        let record = f.component.record().await;
        assert_eq!(record.run_state, RunState::Running);
        assert_eq!(record.last_start, Some(Timestamp(1_000)));
        assert_eq!(record.last_stop, None);
        assert_eq!(record.last_write, Some(Timestamp(1_000)));
        assert_eq!(f.store.pending(&ChannelId::from("hp1/power")).len(), 2);

        f.clock.set(Timestamp(4_000_000));
        f.component.interrupt().await.unwrap();
        let record = f.component.record().await;
        assert_eq!(record.run_state, RunState::Standby);
        assert_eq!(record.last_start, Some(Timestamp(1_000)));
        assert_eq!(record.last_stop, Some(Timestamp(4_000_000)));
        assert_eq!(record.last_write, Some(Timestamp(4_000_000)));
    }

    #[tokio::test]
    async fn test_replacement_schedule_drops_superseded_plan() {
        let f = fixture();
        let day: Schedule = vec![
            Value::double(Timestamp(0), 5.0),
            Value::double(Timestamp(86_400_000), 0.0),
        ]
        .into_iter()
        .collect();
        f.component.schedule(&day).await.unwrap();

        f.clock.set(Timestamp(3_600_000));
        let replacement: Schedule = vec![
            Value::double(Timestamp(3_600_000), 3.0),
            Value::double(Timestamp(7_200_000), 0.0),
        ]
        .into_iter()
        .collect();
        f.component.schedule(&replacement).await.unwrap();
        assert_eq!(f.store.pending(&ChannelId::from("hp1/power")).len(), 1);

        f.clock.set(Timestamp(7_200_000));
        f.component.interrupt().await.unwrap();
        let record = f.component.record().await;
        assert_eq!(record.run_state, RunState::Standby);
        assert_eq!(record.last_stop, Some(Timestamp(7_200_000)));

        f.clock.set(Timestamp(86_400_000));
        f.component.interrupt().await.unwrap();
        assert_eq!(f.component.record().await.last_stop, Some(Timestamp(7_200_000)));
    }

    #[tokio::test]
    async fn test_feedback_completes_transitions() {
        let f = fixture_with(true, settings());
        let feedback = ChannelId::from("hp1/running");

        f.component.start().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Starting);
        f.store.set_value(&feedback, Value::bool(Timestamp(0), true));
        wait_for(&f.component, RunState::Running).await;

        f.clock.set(Timestamp(MIN_RUNTIME));
        f.component.stop().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Stopping);
        f.store.set_value(&feedback, Value::bool(Timestamp(MIN_RUNTIME), false));
        wait_for(&f.component, RunState::Standby).await;
    }

    #[tokio::test]
    async fn test_self_check_reconciles_after_validation_interval() {
        let f = fixture_with(
            true,
            ComponentSettings {
                validation_interval_ms: 10_000,
                ..settings()
            },
        );
        f.component.deactivate();
        // device reports running without having been started
        f.store
            .set_value(&ChannelId::from("hp1/running"), Value::bool(Timestamp(0), true));

        f.component.interrupt().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Standby);
        f.clock.set(Timestamp(9_999));
        f.component.interrupt().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Standby);
        f.clock.set(Timestamp(10_000));
        f.component.interrupt().await.unwrap();
        assert_eq!(f.component.run_state().await, RunState::Running);
    }

    struct Reentrant {
        component: Weak<Component>,
        fired: AtomicBool,
    }

    #[async_trait]
    impl ComponentListener for Reentrant {
        async fn on_event(&self, event: &ComponentEvent) -> anyhow::Result<()> {
            if let ComponentEvent::StateChanged { to: RunState::Running, .. } = event {
                if let Some(component) = self.component.upgrade() {
                    self.fired.store(true, Ordering::SeqCst);
                    // same component, from inside its own dispatch
                    component.stop_with(true).await?;
                    component.deactivate();
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reentrant_listener_does_not_deadlock() {
        let f = fixture_with(
            false,
            ComponentSettings {
                guard: GuardConfig::default(),
                ..settings()
            },
        );
        let listener = Arc::new(Reentrant {
            component: Arc::downgrade(&f.component),
            fired: AtomicBool::new(false),
        });
        f.component.add_listener(listener.clone());

        tokio::time::timeout(Duration::from_secs(2), f.component.start())
            .await
            .expect("deadlock")
            .unwrap();
        assert!(listener.fired.load(Ordering::SeqCst));
        assert_eq!(f.component.run_state().await, RunState::Standby);
        assert!(!f.component.is_active());
        assert_eq!(f.component.listener_count(), 0);
    }

    struct Gate {
        start: AtomicBool,
        stop: AtomicBool,
        attached: AtomicUsize,
    }

    impl Prerequisite for Gate {
        fn name(&self) -> &str {
            "gate"
        }
        fn allows_start(&self) -> bool {
            self.start.load(Ordering::SeqCst)
        }
        fn allows_stop(&self) -> bool {
            self.stop.load(Ordering::SeqCst)
        }
        fn attach(self: Arc<Self>) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_prerequisites_gate_unenforced_actions() {
        let clock = Arc::new(ManualClock::new(Timestamp(0)));
        let store = Arc::new(MemoryChannelStore::new(clock.clone()));
        let gate = Arc::new(Gate {
            start: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            attached: AtomicUsize::new(0),
        });
        let component = Arc::new(
            Component::new(
                "hp1",
                ComponentType::HeatPump,
                CapabilitySet::empty()
                    .with(Capability::Runnable)
                    .with(Capability::Heating),
                Arc::new(PowerHooks {
                    power: ChannelId::from("hp1/power"),
                    feedback: None,
                }),
                store,
                clock,
                ComponentSettings::default(),
            )
            .with_prerequisites(vec![gate.clone()]),
        );
        component.activate();
        assert_eq!(gate.attached.load(Ordering::SeqCst), 1);

        assert!(!component.is_startable().await);
        assert!(matches!(
            component.start().await,
            Err(ComponentError::PrerequisiteNotMet { action: Action::Start, .. })
        ));
        gate.start.store(true, Ordering::SeqCst);
        component.start().await.unwrap();

        assert!(matches!(
            component.stop().await,
            Err(ComponentError::PrerequisiteNotMet { action: Action::Stop, .. })
        ));
        component.stop_with(true).await.unwrap();
    }
}
