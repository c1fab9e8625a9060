//! Controller loop: watch -> work queue -> reconcile workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::dispatcher::ReconcileDispatcher;
use crate::queue::WorkQueue;
use crate::registry::HandlerRegistry;
use crate::resource::{Reason, ReconcileRequest, ResourceRef, ResourceSnapshot};
use crate::store::{LabelSelector, ResourceStore, WatchEvent};

/// Controller for one resource kind.
pub struct Controller {
    store: Arc<dyn ResourceStore>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<ReconcileDispatcher>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        registry: Arc<HandlerRegistry>,
        config: ControllerConfig,
    ) -> Self {
        let dispatcher = Arc::new(ReconcileDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.clone(),
        ));
        Self {
            store,
            registry,
            dispatcher,
            queue: Arc::new(WorkQueue::new()),
            config,
        }
    }

    pub fn dispatcher(&self) -> Arc<ReconcileDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Spawn the watch pump and the worker pool.
    pub fn start(self) -> ControllerHandle {
        info!(
            "Starting {} controller with {} worker(s)",
            self.store.kind(),
            self.config.workers
        );

        // Subscribe before the initial list so nothing falls in between.
        let events = self.store.subscribe();
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);

        let mut tasks = Vec::with_capacity(self.config.workers + 1);
        tasks.push(tokio::spawn(watch_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.queue),
            events,
            self.config.resync_interval,
            stop_rx,
        )));

        for worker in 0..self.config.workers.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                worker,
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.queue),
                self.config.clone(),
            )));
        }

        ControllerHandle {
            registry: self.registry,
            dispatcher: self.dispatcher,
            queue: self.queue,
            stop_tx: Some(stop_tx),
            tasks,
        }
    }
}

/// Running controller.
pub struct ControllerHandle {
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<ReconcileDispatcher>,
    queue: Arc<WorkQueue>,
    stop_tx: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ReconcileDispatcher> {
        &self.dispatcher
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Stop the watch pump and workers, wait for in-flight rounds to finish
    /// and clear the handler registry.
    pub async fn shutdown(mut self) {
        info!("Stopping controller");
        drop(self.stop_tx.take());
        self.queue.shutdown();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Controller task ended abnormally: {}", e);
            }
        }
        self.registry.clear();
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Last state the watch pump saw for each resource.
type KnownState = HashMap<ResourceRef, ResourceSnapshot>;

fn observe(known: &mut KnownState, event: &WatchEvent) {
    match event {
        WatchEvent::Deleted(snapshot) => {
            known.remove(snapshot.reference());
        }
        _ => {
            known.insert(event.reference().clone(), event.snapshot().clone());
        }
    }
}

/// List everything and enqueue it with `reason`. Resources known from
/// earlier but missing from the list were deleted while their events were
/// lost, so they get a delete round on their last known state.
async fn relist(
    store: &dyn ResourceStore,
    queue: &WorkQueue,
    known: &mut KnownState,
    reason: Reason,
) {
    let items = match store.list(&LabelSelector::everything()).await {
        Ok(items) => items,
        Err(e) => {
            warn!("Failed to list {}: {}", store.kind(), e);
            return;
        }
    };
    debug!("Enqueueing {} {}(s)", items.len(), store.kind());

    let listed: KnownState = items
        .into_iter()
        .map(|snapshot| (snapshot.reference().clone(), snapshot))
        .collect();

    for (reference, last_known) in known.drain() {
        if !listed.contains_key(&reference) {
            info!("{} vanished while unwatched, reconciling delete", reference);
            queue.add(ReconcileRequest::new(
                Reason::Delete,
                last_known.into_tombstone(),
            ));
        }
    }
    for snapshot in listed.values() {
        queue.add(ReconcileRequest::new(reason, snapshot.clone()));
    }
    *known = listed;
}

async fn watch_loop(
    store: Arc<dyn ResourceStore>,
    queue: Arc<WorkQueue>,
    mut events: broadcast::Receiver<WatchEvent>,
    resync_interval: Option<Duration>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    let mut known = KnownState::new();
    relist(store.as_ref(), &queue, &mut known, Reason::Create).await;

    let mut resync = resync_interval.map(|period| interval_at(Instant::now() + period, period));

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("Watch loop stopping");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    debug!("Watch event {} for {}", event.reason(), event.reference());
                    observe(&mut known, &event);
                    queue.add(event.into());
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Watch lagged by {} event(s), relisting", skipped);
                    relist(store.as_ref(), &queue, &mut known, Reason::Update).await;
                }
                Err(RecvError::Closed) => {
                    info!("Watch stream closed");
                    break;
                }
            },
            _ = tick(&mut resync) => {
                debug!("Periodic resync");
                relist(store.as_ref(), &queue, &mut known, Reason::Update).await;
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    dispatcher: Arc<ReconcileDispatcher>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
) {
    debug!("Worker {} started", worker);

    while let Some(request) = queue.get().await {
        let reference = request.reference.clone();

        let failure = match dispatcher.dispatch(request.clone()).await {
            Ok(report) if report.is_success() => None,
            Ok(report) => Some(format!(
                "{} handler failure(s)",
                report.failures().count()
            )),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => queue.forget(&reference),
            Some(reason) => requeue(&queue, request, &config, &reason),
        }
        queue.done(&reference);
    }

    debug!("Worker {} stopped", worker);
}

fn requeue(
    queue: &Arc<WorkQueue>,
    request: ReconcileRequest,
    config: &ControllerConfig,
    reason: &str,
) {
    let failures = queue.record_failure(&request.reference);
    if failures >= config.requeue.max_attempts {
        error!(
            "Dropping {} after {} failed round(s): {}",
            request.reference, failures, reason
        );
        queue.forget(&request.reference);
        return;
    }

    let delay = config.requeue.delay(failures);
    warn!(
        "Requeueing {} in {:?} (failure {}): {}",
        request.reference, delay, failures, reason
    );
    queue.add_after(request, delay);
}
