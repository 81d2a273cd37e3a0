use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::component::Component;
use crate::error::ManagerError;

/// Live component set. The lock is held only for the map operation itself;
/// cycles work on a [`snapshot`](ComponentRegistry::snapshot).
#[derive(Default)]
pub struct ComponentRegistry {
    components: Mutex<HashMap<String, Arc<Component>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: Arc<Component>) -> Result<(), ManagerError> {
        let mut components = self.components.lock();
        if components.contains_key(component.id()) {
            return Err(ManagerError::DuplicateComponent(component.id().to_string()));
        }
        components.insert(component.id().to_string(), component);
        Ok(())
    }

    pub fn unregister(&self, id: &str) -> Option<Arc<Component>> {
        self.components.lock().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Component>> {
        self.components.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.components.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.lock().is_empty()
    }

    /// Components sorted by id
    pub fn snapshot(&self) -> Vec<Arc<Component>> {
        let mut components: Vec<_> = self.components.lock().values().cloned().collect();
        components.sort_by(|a, b| a.id().cmp(b.id()));
        components
    }
}
