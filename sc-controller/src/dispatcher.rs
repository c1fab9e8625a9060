//! Reconcile dispatcher.
//!
//! Turns one [`ReconcileRequest`] into a best-effort pass over every
//! registered handler. Rounds for the same resource are serialized through
//! a per-reference single-flight lock; rounds for different resources run
//! in parallel.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::handler::{Handler, HandlerOutcome, ReconcileContext};
use crate::patch::PatchApplier;
use crate::registry::{HandlerName, HandlerRegistry};
use crate::resource::{
    Reason, ReconcileRequest, ResourceKind, ResourceRef, ResourceSnapshot, Version,
};
use crate::store::ResourceStore;

type FlightSlots = HashMap<ResourceRef, Arc<tokio::sync::Mutex<()>>>;
type FlightMap = Arc<Mutex<FlightSlots>>;

fn lock_flights(flights: &FlightMap) -> MutexGuard<'_, FlightSlots> {
    flights.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop the map entry for `reference` once nobody holds or awaits it.
fn release_slot(flights: &FlightMap, reference: &ResourceRef) {
    let mut map = lock_flights(flights);
    if map
        .get(reference)
        .is_some_and(|slot| Arc::strong_count(slot) == 1)
    {
        map.remove(reference);
    }
}

/// Held for the duration of one round. Releasing happens on drop, so the
/// lock is freed on every exit path: success, error, timeout, panic or the
/// round future being dropped.
struct FlightGuard {
    reference: ResourceRef,
    flights: FlightMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.guard.take();
        release_slot(&self.flights, &self.reference);
    }
}

/// Result of one handler in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Nothing needed writing.
    Unchanged,
    /// A patch was committed at this version.
    Patched(Version),
}

#[derive(Debug)]
pub struct HandlerReport {
    pub name: HandlerName,
    pub result: Result<HandlerResult>,
}

/// Aggregated outcome of one round.
#[derive(Debug)]
pub struct RoundReport {
    pub reference: ResourceRef,
    pub reason: Reason,
    pub round: u64,
    /// Version the handlers were invoked against.
    pub observed: Version,
    pub outcomes: Vec<HandlerReport>,
}

impl RoundReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }

    /// Number of handlers invoked.
    pub fn invoked(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcome(&self, name: &str) -> Option<&Result<HandlerResult>> {
        self.outcomes
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.result)
    }
}

/// Fans each request out to the registered handlers.
pub struct ReconcileDispatcher {
    kind: ResourceKind,
    store: Arc<dyn ResourceStore>,
    registry: Arc<HandlerRegistry>,
    applier: PatchApplier,
    flights: FlightMap,
    rounds: AtomicU64,
    config: ControllerConfig,
}

impl ReconcileDispatcher {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<HandlerRegistry>,
        config: ControllerConfig,
    ) -> Self {
        let applier = PatchApplier::new(
            Arc::clone(&store),
            config.store_timeout,
            config.conflict_retry,
        );
        Self {
            kind: store.kind(),
            store,
            registry,
            applier,
            flights: Arc::new(Mutex::new(HashMap::new())),
            rounds: AtomicU64::new(0),
            config,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Number of resources with a round running or waiting to run.
    pub fn in_flight(&self) -> usize {
        lock_flights(&self.flights).len()
    }

    /// Run one round for `request`.
    ///
    /// Handler failures are reported in the [`RoundReport`]; only failing to
    /// start the round (lock timeout, unreadable starting state) is an `Err`.
    pub async fn dispatch(&self, request: ReconcileRequest) -> Result<RoundReport> {
        let _flight = self.acquire(&request.reference).await?;

        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let handlers = self.registry.snapshot();
        let snapshot = self.round_snapshot(&request).await?;

        info!(
            "Round {}: reconciling {} {} ({}, version {}, {} handler(s))",
            round,
            self.kind,
            request.reference,
            request.reason,
            snapshot.version(),
            handlers.len()
        );

        let ctx = ReconcileContext {
            kind: self.kind,
            reference: request.reference.clone(),
            reason: request.reason,
            round,
            attempt: 1,
        };

        let outcomes = join_all(handlers.into_iter().map(|(name, handler)| {
            self.run_handler(ctx.clone(), name, handler, snapshot.clone())
        }))
        .await;

        let report = RoundReport {
            reference: request.reference,
            reason: request.reason,
            round,
            observed: snapshot.version(),
            outcomes,
        };

        if report.is_success() {
            info!("Round {}: {} reconciled", round, report.reference);
        } else {
            for (name, e) in report.failures() {
                warn!("Round {}: handler {} failed on {}: {}", round, name, report.reference, e);
            }
        }
        Ok(report)
    }

    async fn acquire(&self, reference: &ResourceRef) -> Result<FlightGuard> {
        let slot = {
            let mut map = lock_flights(&self.flights);
            Arc::clone(map.entry(reference.clone()).or_default())
        };

        match tokio::time::timeout(self.config.lock_timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(FlightGuard {
                reference: reference.clone(),
                flights: Arc::clone(&self.flights),
                guard: Some(guard),
            }),
            Err(_) => {
                release_slot(&self.flights, reference);
                Err(Error::Timeout {
                    operation: format!("single-flight lock for {}", reference),
                    after: self.config.lock_timeout,
                })
            }
        }
    }

    /// State the handlers will see. Deletes use the tombstone from the
    /// notification; everything else re-reads so a coalesced request acts
    /// on the latest state.
    async fn round_snapshot(&self, request: &ReconcileRequest) -> Result<ResourceSnapshot> {
        if request.reason == Reason::Delete {
            return Ok(request.snapshot.clone().into_tombstone());
        }

        match tokio::time::timeout(self.config.store_timeout, self.store.get(&request.reference))
            .await
        {
            Err(_) => Err(Error::Timeout {
                operation: format!("read {}", request.reference),
                after: self.config.store_timeout,
            }),
            Ok(Err(e)) => Err(Error::TransientRead(e)),
            Ok(Ok(Some(current))) => Ok(current),
            Ok(Ok(None)) => {
                debug!("{} vanished before its round, using tombstone", request.reference);
                Ok(request.snapshot.clone().into_tombstone())
            }
        }
    }

    async fn run_handler(
        &self,
        ctx: ReconcileContext,
        name: HandlerName,
        handler: Arc<dyn Handler>,
        snapshot: ResourceSnapshot,
    ) -> HandlerReport {
        let result = match self.invoke(&name, handler.as_ref(), &ctx, &snapshot).await {
            Err(e) => Err(e),
            Ok(HandlerOutcome::NoOp) => Ok(HandlerResult::Unchanged),
            Ok(HandlerOutcome::Patch(patch)) => {
                let reference = snapshot.reference().clone();
                let name_ref = name.as_str();
                let mut attempt = ctx.attempt;
                let applied = self
                    .applier
                    .apply_with_retry(snapshot, patch, |latest| {
                        attempt += 1;
                        let ctx = ReconcileContext {
                            attempt,
                            ..ctx.clone()
                        };
                        let handler = Arc::clone(&handler);
                        async move {
                            let outcome =
                                self.invoke(name_ref, handler.as_ref(), &ctx, &latest).await?;
                            Ok::<_, Error>(match outcome {
                                HandlerOutcome::NoOp => None,
                                HandlerOutcome::Patch(patch) => Some(patch),
                            })
                        }
                    })
                    .await;

                match applied {
                    Ok(Some(version)) => self.settle(&reference, version).await,
                    Ok(None) => Ok(HandlerResult::Unchanged),
                    Err(e) => Err(e),
                }
            }
        };

        HandlerReport { name, result }
    }

    /// Call one handler with panic isolation and a deadline.
    async fn invoke(
        &self,
        name: &str,
        handler: &dyn Handler,
        ctx: &ReconcileContext,
        snapshot: &ResourceSnapshot,
    ) -> Result<HandlerOutcome> {
        debug!(
            "Round {}: invoking handler {} on {} (attempt {})",
            ctx.round, name, ctx.reference, ctx.attempt
        );

        let call = AssertUnwindSafe(handler.reconcile(ctx, snapshot)).catch_unwind();
        match tokio::time::timeout(self.config.handler_timeout, call).await {
            Err(_) => Err(Error::Handler {
                name: name.to_string(),
                message: format!("timed out after {:?}", self.config.handler_timeout),
            }),
            Ok(Err(panic)) => Err(Error::Handler {
                name: name.to_string(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
            Ok(Ok(Err(e))) => Err(Error::Handler {
                name: name.to_string(),
                message: format!("{:#}", e),
            }),
            Ok(Ok(Ok(outcome))) => Ok(outcome),
        }
    }

    async fn settle(&self, reference: &ResourceRef, version: Version) -> Result<HandlerResult> {
        let Some(poller) = self.config.settle else {
            return Ok(HandlerResult::Patched(version));
        };

        poller
            .wait_until(self.store.as_ref(), reference, |current| {
                current.map_or(true, |s| s.version() >= version)
            })
            .await?;
        Ok(HandlerResult::Patched(version))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
