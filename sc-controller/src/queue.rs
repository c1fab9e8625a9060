//! Coalescing work queue keyed by resource.
//!
//! At most one request per resource waits in the queue; a newer request for
//! the same resource replaces the waiting one. A resource handed to a worker
//! is not handed out again until that worker calls [`WorkQueue::done`], and
//! anything that arrived in the meantime is queued at that point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::resource::{ReconcileRequest, ResourceRef};

#[derive(Default)]
struct QueueState {
    order: VecDeque<ResourceRef>,
    pending: HashMap<ResourceRef, ReconcileRequest>,
    processing: HashSet<ResourceRef>,
    failures: HashMap<ResourceRef, u32>,
    shut_down: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `request`, replacing any request already waiting for the same
    /// resource.
    pub fn add(&self, request: ReconcileRequest) {
        self.insert(request, true);
    }

    /// Queue `request` after `delay`, unless a request for the same resource
    /// is already waiting by then.
    pub fn add_after(self: &Arc<Self>, request: ReconcileRequest, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.insert(request, false);
        });
    }

    fn insert(&self, request: ReconcileRequest, replace: bool) {
        let mut state = self.lock();
        if state.shut_down {
            return;
        }

        let reference = request.reference.clone();
        let was_pending = state.pending.contains_key(&reference);
        if was_pending && !replace {
            return;
        }
        if was_pending {
            debug!("Coalescing request for {}", reference);
        }
        state.pending.insert(reference.clone(), request);

        if !was_pending && !state.processing.contains(&reference) {
            state.order.push_back(reference);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next request. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ReconcileRequest> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shut_down {
                    return None;
                }
                while let Some(reference) = state.order.pop_front() {
                    if let Some(request) = state.pending.remove(&reference) {
                        state.processing.insert(reference);
                        return Some(request);
                    }
                }
            }

            notified.await;
        }
    }

    /// Mark `reference` as finished by its worker.
    pub fn done(&self, reference: &ResourceRef) {
        let mut state = self.lock();
        state.processing.remove(reference);
        if state.pending.contains_key(reference) && !state.shut_down {
            state.order.push_back(reference.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Count one more failed round for `reference` and return the total.
    pub fn record_failure(&self, reference: &ResourceRef) -> u32 {
        let mut state = self.lock();
        let count = state.failures.entry(reference.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset the failure count for `reference`.
    pub fn forget(&self, reference: &ResourceRef) {
        self.lock().failures.remove(reference);
    }

    pub fn failures(&self, reference: &ResourceRef) -> u32 {
        self.lock().failures.get(reference).copied().unwrap_or(0)
    }

    /// Number of requests waiting.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, reference: &ResourceRef) -> bool {
        self.lock().processing.contains(reference)
    }

    /// Stop handing out work and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shut_down = true;
        self.notify.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
