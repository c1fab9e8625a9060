//! Change notifications emitted by the store.

use crate::resource::{Reason, ReconcileRequest, ResourceRef, ResourceSnapshot};

/// Events emitted when a resource changes.
///
/// These events are dispatched via a broadcast channel to subscribers.
/// Delivery is at-least-once from the consumer's point of view: a lagging
/// subscriber relists and may observe the same state twice.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// A resource was created.
    Added(ResourceSnapshot),
    /// A resource was modified.
    Modified {
        old: ResourceSnapshot,
        new: ResourceSnapshot,
    },
    /// A resource was deleted. Carries the last known state as a tombstone.
    Deleted(ResourceSnapshot),
}

impl WatchEvent {
    pub fn reason(&self) -> Reason {
        match self {
            WatchEvent::Added(_) => Reason::Create,
            WatchEvent::Modified { .. } => Reason::Update,
            WatchEvent::Deleted(_) => Reason::Delete,
        }
    }

    /// The state after the change.
    pub fn snapshot(&self) -> &ResourceSnapshot {
        match self {
            WatchEvent::Added(s) | WatchEvent::Deleted(s) => s,
            WatchEvent::Modified { new, .. } => new,
        }
    }

    pub fn reference(&self) -> &ResourceRef {
        self.snapshot().reference()
    }
}

impl From<WatchEvent> for ReconcileRequest {
    fn from(event: WatchEvent) -> Self {
        let reason = event.reason();
        let snapshot = match event {
            WatchEvent::Added(s) | WatchEvent::Deleted(s) => s,
            WatchEvent::Modified { new, .. } => new,
        };
        ReconcileRequest::new(reason, snapshot)
    }
}
