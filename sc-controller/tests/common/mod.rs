//! Shared test utilities for sc-controller integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use sc_controller::store::Result as StoreResult;
use sc_controller::{
    Backoff, Controller, ControllerConfig, ControllerHandle, ConvergencePoller, HandlerRegistry,
    LabelSelector, MemoryStore, PatchOp, ResourceKind, ResourceRef, ResourceSnapshot,
    ResourceStore, StorageClass, StoreError, Version, WatchEvent, IS_DEFAULT_CLASS_ANNOTATION,
};

/// Label every test StorageClass carries, used for cleanup.
pub const TEST_LABEL: &str = "sc-controller.test/owned";

/// Default poller for convergence assertions.
pub fn poller() -> ConvergencePoller {
    ConvergencePoller::new(Duration::from_secs(20), Duration::from_millis(100))
}

/// Config with short retry delays.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        workers: 2,
        conflict_retry: Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(20),
            factor: 2,
            max_attempts: 10,
        },
        requeue: Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            factor: 2,
            max_attempts: 10,
        },
        ..ControllerConfig::default()
    }
}

/// Default-class manifest with a random-suffixed name.
pub fn storage_class(prefix: &str) -> StorageClass {
    let name = format!("{}-{}", prefix, &uuid::Uuid::new_v4().to_string()[..8]);
    let mut class = StorageClass::new(name, "hostpath.csi.k8s.io");
    class
        .metadata
        .annotations
        .insert(IS_DEFAULT_CLASS_ANNOTATION.to_string(), "true".to_string());
    class
        .metadata
        .labels
        .insert(TEST_LABEL.to_string(), "true".to_string());
    class.allow_volume_expansion = Some(true);
    class
}

/// Running controller over a store, with its registry.
pub struct TestController {
    pub store: Arc<dyn ResourceStore>,
    pub registry: Arc<HandlerRegistry>,
    handle: ControllerHandle,
}

impl TestController {
    /// Spawn a controller over a fresh in-memory store.
    pub fn spawn(registry: Arc<HandlerRegistry>) -> Self {
        Self::spawn_with(
            Arc::new(MemoryStore::new(ResourceKind::STORAGE_CLASS)),
            registry,
            fast_config(),
        )
    }

    pub fn spawn_with(
        store: Arc<dyn ResourceStore>,
        registry: Arc<HandlerRegistry>,
        config: ControllerConfig,
    ) -> Self {
        let handle = Controller::new(Arc::clone(&store), Arc::clone(&registry), config).start();
        Self {
            store,
            registry,
            handle,
        }
    }

    pub fn handle(&self) -> &ControllerHandle {
        &self.handle
    }

    /// Create `class` and return its reference.
    pub async fn create(&self, class: StorageClass) -> ResourceRef {
        let reference = class.reference();
        self.store
            .create(&reference, class.into_fields().expect("Failed to serialize"))
            .await
            .expect("Failed to create StorageClass");
        reference
    }

    /// Wait until `key` has `value` on `reference`.
    pub async fn wait_for_annotation(
        &self,
        reference: &ResourceRef,
        key: &str,
        value: &str,
    ) -> ResourceSnapshot {
        poller()
            .wait_until(self.store.as_ref(), reference, |current| {
                current.is_some_and(|s| s.annotation(key) == Some(value))
            })
            .await
            .expect("Annotation did not converge")
            .expect("Resource disappeared")
    }

    /// Delete every test-owned StorageClass and stop the controller.
    pub async fn shutdown(self) {
        let deleted = self
            .store
            .delete_collection(&LabelSelector::has_labels([TEST_LABEL]))
            .await
            .expect("Failed to clean up");
        tracing::debug!("Cleaned up {} StorageClass(es)", deleted);
        self.handle.shutdown().await;
    }
}

/// Store whose first `failures` reads fail with [`StoreError::Unavailable`].
pub struct FlakyStore {
    inner: MemoryStore,
    remaining: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(ResourceKind::STORAGE_CLASS),
            remaining: AtomicU32::new(failures),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ResourceStore for FlakyStore {
    fn kind(&self) -> ResourceKind {
        self.inner.kind()
    }

    async fn get(&self, reference: &ResourceRef) -> StoreResult<Option<ResourceSnapshot>> {
        if self.take_failure() {
            return Err(StoreError::Unavailable("injected read failure".to_string()));
        }
        self.inner.get(reference).await
    }

    async fn list(&self, selector: &LabelSelector) -> StoreResult<Vec<ResourceSnapshot>> {
        self.inner.list(selector).await
    }

    async fn create(
        &self,
        reference: &ResourceRef,
        fields: Value,
    ) -> StoreResult<ResourceSnapshot> {
        self.inner.create(reference, fields).await
    }

    async fn update(
        &self,
        reference: &ResourceRef,
        expected: Option<Version>,
        fields: Value,
    ) -> StoreResult<ResourceSnapshot> {
        self.inner.update(reference, expected, fields).await
    }

    async fn patch(
        &self,
        reference: &ResourceRef,
        base: Version,
        patch: &PatchOp,
    ) -> StoreResult<ResourceSnapshot> {
        self.inner.patch(reference, base, patch).await
    }

    async fn delete(&self, reference: &ResourceRef) -> StoreResult<()> {
        self.inner.delete(reference).await
    }

    async fn delete_collection(&self, selector: &LabelSelector) -> StoreResult<usize> {
        self.inner.delete_collection(selector).await
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.subscribe()
    }
}
