//! ResourceStore trait definitions.
//!
//! The store is the single source of truth for resource state and for
//! concurrency control: every conditional write names the version it was
//! based on and is rejected if that version is no longer current.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::error::Result;
use super::event::WatchEvent;
use crate::patch::PatchOp;
use crate::resource::{ResourceKind, ResourceRef, ResourceSnapshot, Version};

/// Label-based filter for list and bulk-delete operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    present: Vec<String>,
    equal: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Matches every resource.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Matches resources carrying all of `keys`, whatever their values.
    pub fn has_labels<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            present: keys.into_iter().map(Into::into).collect(),
            equal: BTreeMap::new(),
        }
    }

    /// Additionally require `key == value`.
    pub fn matching(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equal.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, snapshot: &ResourceSnapshot) -> bool {
        self.present.iter().all(|k| snapshot.label(k).is_some())
            && self
                .equal
                .iter()
                .all(|(k, v)| snapshot.label(k) == Some(v.as_str()))
    }
}

/// Store for one resource kind.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// The kind of resource this store holds.
    fn kind(&self) -> ResourceKind;

    /// Get a resource by reference.
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ResourceSnapshot>>;

    /// List resources matching `selector`.
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<ResourceSnapshot>>;

    /// Create a new resource.
    async fn create(&self, reference: &ResourceRef, fields: Value) -> Result<ResourceSnapshot>;

    /// Replace a resource's fields. With `expected` set the write is
    /// conditional on the current version.
    async fn update(
        &self,
        reference: &ResourceRef,
        expected: Option<Version>,
        fields: Value,
    ) -> Result<ResourceSnapshot>;

    /// Merge `patch` into the resource if its version is still `base`.
    async fn patch(
        &self,
        reference: &ResourceRef,
        base: Version,
        patch: &PatchOp,
    ) -> Result<ResourceSnapshot>;

    /// Delete a resource.
    async fn delete(&self, reference: &ResourceRef) -> Result<()>;

    /// Delete every resource matching `selector`. Returns how many went.
    async fn delete_collection(&self, selector: &LabelSelector) -> Result<usize>;

    /// Subscribe to change events.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}
