//! Merge patches and the conditional patch path to the store.
//!
//! A [`PatchOp`] is a JSON merge patch (RFC 7386) computed as the difference
//! between the fields a handler observed and the fields it wants. The
//! [`PatchApplier`] submits it conditioned on the observed [`Version`], so a
//! write based on stale state is rejected instead of merged.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::Backoff;
use crate::error::{Error, Result};
use crate::resource::{ResourceRef, ResourceSnapshot, Version};
use crate::store::{ResourceStore, StoreError};

/// Field-level changes one handler wants applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchOp(Value);

impl PatchOp {
    /// Empty patch; applying it changes nothing.
    pub fn new() -> Self {
        Self(Value::Object(Map::new()))
    }

    /// Merge patch turning `observed` into `desired`.
    ///
    /// Removed keys become `null`, nested objects are diffed recursively and
    /// anything else that changed is replaced whole (arrays included).
    pub fn diff(observed: &Value, desired: &Value) -> Self {
        match (observed, desired) {
            (Value::Object(old), Value::Object(new)) => Self(Value::Object(diff_objects(old, new))),
            _ if observed == desired => Self::new(),
            _ => Self(desired.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Merge this patch into `target`.
    pub fn apply_to(&self, target: &mut Value) {
        merge(target, &self.0);
    }

    /// JSON pointers of every leaf this patch touches.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        collect_paths(&self.0, String::new(), &mut out);
        out
    }
}

fn diff_objects(old: &Map<String, Value>, new: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();

    for key in old.keys() {
        if !new.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }

    for (key, desired) in new {
        match (old.get(key), desired) {
            (Some(observed), _) if observed == desired => {}
            (Some(Value::Object(o)), Value::Object(n)) => {
                let nested = diff_objects(o, n);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {
                patch.insert(key.clone(), desired.clone());
            }
        }
    }

    patch
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
            } else {
                merge(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn collect_paths(value: &Value, prefix: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                collect_paths(child, format!("{}/{}", prefix, escaped), out);
            }
        }
        _ if !prefix.is_empty() => out.push(prefix),
        _ => {}
    }
}

/// The only code path that writes handler mutations to the store.
pub struct PatchApplier {
    store: Arc<dyn ResourceStore>,
    timeout: Duration,
    retry: Backoff,
}

impl PatchApplier {
    pub fn new(store: Arc<dyn ResourceStore>, timeout: Duration, retry: Backoff) -> Self {
        Self {
            store,
            timeout,
            retry,
        }
    }

    /// Submit `patch` conditioned on `base`.
    ///
    /// Returns the new version, or `base` unchanged when the patch is empty.
    /// A stale `base` yields [`Error::Conflict`].
    pub async fn apply(
        &self,
        reference: &ResourceRef,
        base: Version,
        patch: &PatchOp,
    ) -> Result<Version> {
        if patch.is_empty() {
            return Ok(base);
        }

        debug!("Patching {} at version {}: {:?}", reference, base, patch.paths());
        match tokio::time::timeout(self.timeout, self.store.patch(reference, base, patch)).await {
            Err(_) => Err(Error::Timeout {
                operation: format!("patch {}", reference),
                after: self.timeout,
            }),
            Ok(Err(StoreError::VersionMismatch { .. })) => Err(Error::Conflict {
                reference: reference.clone(),
                attempts: 1,
            }),
            Ok(Err(e)) => Err(Error::Store(e)),
            Ok(Ok(updated)) => Ok(updated.version()),
        }
    }

    /// Apply `patch` and, on conflict, re-read the latest state and ask
    /// `recompute` for the same logical mutation against it.
    ///
    /// `recompute` returning `None` means the mutation is already in place.
    /// Returns `None` when nothing had to be written.
    pub async fn apply_with_retry<F, Fut>(
        &self,
        snapshot: ResourceSnapshot,
        patch: PatchOp,
        mut recompute: F,
    ) -> Result<Option<Version>>
    where
        F: FnMut(ResourceSnapshot) -> Fut,
        Fut: Future<Output = Result<Option<PatchOp>>>,
    {
        let reference = snapshot.reference().clone();
        if snapshot.is_tombstone() {
            return Err(Error::Store(StoreError::NotFound(reference)));
        }

        let mut base = snapshot.version();
        let mut patch = patch;
        let mut attempt = 1;

        loop {
            if patch.is_empty() {
                return Ok(None);
            }

            match self.apply(&reference, base, &patch).await {
                Ok(version) => return Ok(Some(version)),
                Err(Error::Conflict { .. }) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    debug!(
                        "Conflict patching {} at version {} (attempt {}), retrying in {:?}",
                        reference, base, attempt, delay
                    );
                    tokio::time::sleep(delay).await;

                    let latest = self.read_latest(&reference).await?;
                    base = latest.version();
                    match recompute(latest).await? {
                        Some(next) => patch = next,
                        None => return Ok(None),
                    }
                    attempt += 1;
                }
                Err(Error::Conflict { .. }) => {
                    warn!(
                        "Giving up on {} after {} conflicting attempt(s)",
                        reference, attempt
                    );
                    return Err(Error::Conflict {
                        reference,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_latest(&self, reference: &ResourceRef) -> Result<ResourceSnapshot> {
        match tokio::time::timeout(self.timeout, self.store.get(reference)).await {
            Err(_) => Err(Error::Timeout {
                operation: format!("read {}", reference),
                after: self.timeout,
            }),
            Ok(Ok(Some(latest))) => Ok(latest),
            Ok(Ok(None)) => Err(Error::Store(StoreError::NotFound(reference.clone()))),
            Ok(Err(e)) => Err(Error::TransientRead(e)),
        }
    }
}
