//! Named handler registry.
//!
//! The registry is the extension point of the controller: setup code,
//! plugins and tests attach and detach behaviour by name while rounds are
//! running. Each round works on a [`HandlerRegistry::snapshot`] taken at its
//! start, so edits never leak into a round already in progress.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::handler::Handler;

pub type HandlerName = String;

/// Mapping from handler name to handler for one resource kind.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<HandlerName, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` under `name`, replacing any previous entry.
    /// Returns the replaced handler.
    pub fn register<H>(&self, name: impl Into<HandlerName>, handler: H) -> Option<Arc<dyn Handler>>
    where
        H: Handler + 'static,
    {
        self.register_arc(name, Arc::new(handler))
    }

    pub fn register_arc(
        &self,
        name: impl Into<HandlerName>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        let name = name.into();
        debug!("Registering handler {}", name);
        self.write().insert(name, handler)
    }

    /// Remove the handler under `name`. Returns whether one was present.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.write().remove(name).is_some();
        if removed {
            debug!("Unregistered handler {}", name);
        }
        removed
    }

    /// Handlers for one dispatch round, ordered by name.
    pub fn snapshot(&self) -> Vec<(HandlerName, Arc<dyn Handler>)> {
        self.read()
            .iter()
            .map(|(name, handler)| (name.clone(), Arc::clone(handler)))
            .collect()
    }

    /// Drop every handler (controller shutdown, test teardown).
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<HandlerName> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panicking registrant cannot leave the map half-written, so a
    // poisoned lock still guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<HandlerName, Arc<dyn Handler>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<HandlerName, Arc<dyn Handler>>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}
