use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::channel::ChannelId;
use crate::domain::{RunState, Timestamp, Value};

/// Notification fanned out to a component's dependents
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ComponentEvent {
    StateChanged {
        component: String,
        from: RunState,
        to: RunState,
        at: Timestamp,
    },
    ValueChanged {
        component: String,
        channel: ChannelId,
        value: Value,
    },
}

impl ComponentEvent {
    pub fn component(&self) -> &str {
        match self {
            ComponentEvent::StateChanged { component, .. } => component,
            ComponentEvent::ValueChanged { component, .. } => component,
        }
    }
}

#[async_trait]
pub trait ComponentListener: Send + Sync {
    async fn on_event(&self, event: &ComponentEvent) -> anyhow::Result<()>;
}

fn same(a: &Arc<dyn ComponentListener>, b: &Arc<dyn ComponentListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Ordered listener set of one component
pub struct EventDispatcher {
    component: String,
    listeners: RwLock<Vec<Arc<dyn ComponentListener>>>,
}

impl EventDispatcher {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Returns false if the listener was already registered
    pub fn register(&self, listener: Arc<dyn ComponentListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn deregister(&self, listener: &Arc<dyn ComponentListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same(l, listener));
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver to every listener in registration order; a failing listener is
    /// logged and skipped. Returns how many listeners accepted the event.
    pub async fn dispatch(&self, event: &ComponentEvent) -> usize {
        // snapshot: listeners may (de)register from inside the callback
        let listeners = self.listeners.read().clone();
        let mut delivered = 0;
        for listener in listeners {
            match listener.on_event(event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(component = %self.component, error = %e, "listener failed"),
            }
        }
        delivered
    }
}
