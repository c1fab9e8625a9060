//! Bounded waits for eventually-visible state.
//!
//! Writes reach readers and watchers asynchronously. [`ConvergencePoller`]
//! absorbs that lag: it re-evaluates a probe at a fixed interval until the
//! probe yields a value or the deadline passes. Probe errors count as "not
//! yet" and are never surfaced; a caller only learns that the condition did
//! not hold in time.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resource::{ResourceRef, ResourceSnapshot};
use crate::store::ResourceStore;

/// Timeout and spacing for repeated probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergencePoller {
    pub timeout: Duration,
    pub interval: Duration,
}

impl ConvergencePoller {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Call `probe` immediately and then every `interval` until it returns
    /// `Ok(Some(_))`. Each probe is cut off at the overall deadline.
    pub async fn poll_until<T, E, F, Fut>(&self, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: Display,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match tokio::time::timeout_at(deadline, probe()).await {
                Ok(Ok(Some(value))) => return Ok(value),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!("Probe {} failed, retrying: {}", attempts, e),
                Err(_) => debug!("Probe {} still pending at deadline", attempts),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    operation: format!("convergence wait ({} probes)", attempts),
                    after: self.timeout,
                });
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Read `reference` until `predicate` holds for its current state.
    ///
    /// The predicate sees `None` while the resource does not exist, so the
    /// same call can wait for creation, a field value, or deletion.
    pub async fn wait_until<P>(
        &self,
        store: &dyn ResourceStore,
        reference: &ResourceRef,
        predicate: P,
    ) -> Result<Option<ResourceSnapshot>>
    where
        P: Fn(Option<&ResourceSnapshot>) -> bool,
    {
        let predicate = &predicate;
        self.poll_until(|| async move {
            let current = store.get(reference).await?;
            let holds = predicate(current.as_ref());
            Ok::<_, crate::store::StoreError>(holds.then_some(current))
        })
        .await
    }
}

/// Shorthand for [`ConvergencePoller::wait_until`].
pub async fn wait_until<P>(
    store: &dyn ResourceStore,
    reference: &ResourceRef,
    predicate: P,
    timeout: Duration,
    interval: Duration,
) -> Result<Option<ResourceSnapshot>>
where
    P: Fn(Option<&ResourceSnapshot>) -> bool,
{
    ConvergencePoller::new(timeout, interval)
        .wait_until(store, reference, predicate)
        .await
}
