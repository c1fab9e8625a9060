//! In-memory authoritative store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::error::{Result, StoreError};
use super::event::WatchEvent;
use super::traits::{LabelSelector, ResourceStore};
use crate::patch::PatchOp;
use crate::resource::{ResourceKind, ResourceRef, ResourceSnapshot, Version};

const EVENT_CAPACITY: usize = 1024;

struct StoredObject {
    uid: String,
    created_at: String,
    version: Version,
    fields: Arc<Value>,
}

#[derive(Default)]
struct StoreState {
    revision: u64,
    objects: HashMap<ResourceRef, StoredObject>,
}

impl StoreState {
    fn next_version(&mut self) -> Version {
        self.revision += 1;
        Version::from_raw(self.revision)
    }
}

/// Store keeping every resource of one kind in memory.
///
/// Versions come from a single revision counter bumped on every effective
/// write, so they are unique and increase across the whole store. Writes
/// that would not change any field leave the version alone and emit no
/// event.
pub struct MemoryStore {
    kind: ResourceKind,
    state: RwLock<StoreState>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new(kind: ResourceKind) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind,
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    fn snapshot(reference: &ResourceRef, object: &StoredObject) -> ResourceSnapshot {
        ResourceSnapshot::from_shared(
            reference.clone(),
            object.uid.clone(),
            object.version,
            Arc::clone(&object.fields),
        )
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Replace the current fields of `reference` with `fields`, keeping
    /// system-owned metadata. Caller holds the write lock.
    fn store_fields(
        &self,
        state: &mut StoreState,
        reference: &ResourceRef,
        mut fields: Value,
    ) -> Result<ResourceSnapshot> {
        let (old, uid, created_at) = match state.objects.get(reference) {
            Some(object) => (
                Self::snapshot(reference, object),
                object.uid.clone(),
                object.created_at.clone(),
            ),
            None => return Err(StoreError::NotFound(reference.clone())),
        };

        stamp_metadata(&mut fields, reference, &uid, &created_at);
        if *old.fields() == fields {
            return Ok(old);
        }

        let version = state.next_version();
        let object = StoredObject {
            uid,
            created_at,
            version,
            fields: Arc::new(fields),
        };
        let new = Self::snapshot(reference, &object);
        state.objects.insert(reference.clone(), object);

        debug!("Stored {} {} at version {}", self.kind, reference, version);
        self.emit(WatchEvent::Modified {
            old,
            new: new.clone(),
        });
        Ok(new)
    }

    fn check_version(
        state: &StoreState,
        reference: &ResourceRef,
        expected: Version,
    ) -> Result<()> {
        let object = state
            .objects
            .get(reference)
            .ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        if object.version != expected {
            return Err(StoreError::VersionMismatch {
                reference: reference.clone(),
                expected,
                actual: object.version,
            });
        }
        Ok(())
    }

    fn remove(&self, state: &mut StoreState, reference: &ResourceRef) -> Result<()> {
        let object = state
            .objects
            .remove(reference)
            .ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        state.next_version();
        debug!("Deleted {} {}", self.kind, reference);
        self.emit(WatchEvent::Deleted(
            Self::snapshot(reference, &object).into_tombstone(),
        ));
        Ok(())
    }
}

/// Force `metadata.{name,namespace,uid,creationTimestamp}` to the values the
/// store owns.
fn stamp_metadata(fields: &mut Value, reference: &ResourceRef, uid: &str, created_at: &str) {
    if !fields.is_object() {
        *fields = Value::Object(Map::new());
    }
    let Value::Object(root) = fields else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    let Value::Object(metadata) = metadata else {
        return;
    };

    metadata.insert("name".into(), Value::String(reference.name.clone()));
    match &reference.namespace {
        Some(ns) => {
            metadata.insert("namespace".into(), Value::String(ns.clone()));
        }
        None => {
            metadata.remove("namespace");
        }
    }
    metadata.insert("uid".into(), Value::String(uid.to_string()));
    metadata.insert(
        "creationTimestamp".into(),
        Value::String(created_at.to_string()),
    );
}

#[async_trait]
impl ResourceStore for MemoryStore {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn get(&self, reference: &ResourceRef) -> Result<Option<ResourceSnapshot>> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .get(reference)
            .map(|object| Self::snapshot(reference, object)))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<ResourceSnapshot>> {
        let state = self.state.read().await;
        let mut items: Vec<ResourceSnapshot> = state
            .objects
            .iter()
            .map(|(reference, object)| Self::snapshot(reference, object))
            .filter(|snapshot| selector.matches(snapshot))
            .collect();
        items.sort_by(|a, b| a.reference().cmp(b.reference()));
        Ok(items)
    }

    async fn create(&self, reference: &ResourceRef, mut fields: Value) -> Result<ResourceSnapshot> {
        let mut state = self.state.write().await;
        if state.objects.contains_key(reference) {
            return Err(StoreError::AlreadyExists(reference.clone()));
        }

        let uid = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        stamp_metadata(&mut fields, reference, &uid, &created_at);

        let version = state.next_version();
        let object = StoredObject {
            uid,
            created_at,
            version,
            fields: Arc::new(fields),
        };
        let snapshot = Self::snapshot(reference, &object);
        state.objects.insert(reference.clone(), object);

        debug!("Created {} {} at version {}", self.kind, reference, version);
        self.emit(WatchEvent::Added(snapshot.clone()));
        Ok(snapshot)
    }

    async fn update(
        &self,
        reference: &ResourceRef,
        expected: Option<Version>,
        fields: Value,
    ) -> Result<ResourceSnapshot> {
        let mut state = self.state.write().await;
        if let Some(expected) = expected {
            Self::check_version(&state, reference, expected)?;
        }
        self.store_fields(&mut state, reference, fields)
    }

    async fn patch(
        &self,
        reference: &ResourceRef,
        base: Version,
        patch: &PatchOp,
    ) -> Result<ResourceSnapshot> {
        let mut state = self.state.write().await;
        Self::check_version(&state, reference, base)?;

        let mut fields = match state.objects.get(reference) {
            Some(object) => object.fields.as_ref().clone(),
            None => return Err(StoreError::NotFound(reference.clone())),
        };
        patch.apply_to(&mut fields);
        self.store_fields(&mut state, reference, fields)
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<()> {
        let mut state = self.state.write().await;
        self.remove(&mut state, reference)
    }

    async fn delete_collection(&self, selector: &LabelSelector) -> Result<usize> {
        let mut state = self.state.write().await;
        let doomed: Vec<ResourceRef> = state
            .objects
            .iter()
            .filter(|(reference, object)| selector.matches(&Self::snapshot(reference, object)))
            .map(|(reference, _)| reference.clone())
            .collect();

        for reference in &doomed {
            self.remove(&mut state, reference)?;
        }
        Ok(doomed.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::set_annotation;
    use serde_json::json;

    fn store() -> MemoryStore {
        MemoryStore::new(ResourceKind::STORAGE_CLASS)
    }

    #[tokio::test]
    async fn test_create_stamps_metadata_and_emits() {
        let store = store();
        let mut events = store.subscribe();
        let reference = ResourceRef::cluster("standard");

        let created = store
            .create(&reference, json!({"provisioner": "hostpath.csi.k8s.io"}))
            .await
            .unwrap();

        assert_eq!(created.field("/metadata/name"), Some(&json!("standard")));
        assert!(created.field("/metadata/uid").is_some());
        assert_eq!(
            created.field("/metadata/uid").and_then(Value::as_str),
            Some(created.uid())
        );

        match events.recv().await.unwrap() {
            WatchEvent::Added(s) => assert_eq!(s.version(), created.version()),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let store = store();
        let reference = ResourceRef::cluster("standard");
        store.create(&reference, json!({})).await.unwrap();
        let err = store.create(&reference, json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_patch_with_stale_version_rejected() {
        let store = store();
        let reference = ResourceRef::cluster("standard");
        let created = store.create(&reference, json!({"fa": 1})).await.unwrap();

        let first = created.mutate(|f| f["fa"] = json!(2));
        let updated = store.patch(&reference, created.version(), &first).await.unwrap();
        assert!(updated.version() > created.version());

        let second = created.mutate(|f| f["fa"] = json!(3));
        let err = store
            .patch(&reference, created.version(), &second)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let current = store.get(&reference).await.unwrap().unwrap();
        assert_eq!(current.field("/fa"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_noop_patch_keeps_version_and_is_silent() {
        let store = store();
        let reference = ResourceRef::cluster("standard");
        let created = store.create(&reference, json!({"fa": 1})).await.unwrap();
        let mut events = store.subscribe();

        let same = created.mutate(|f| f["fa"] = json!(1));
        assert!(same.is_empty());
        let unchanged = store
            .patch(&reference, created.version(), &PatchOp::diff(&json!({}), &json!({"fa": 1})))
            .await
            .unwrap();

        assert_eq!(unchanged.version(), created.version());
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_patch_cannot_rename() {
        let store = store();
        let reference = ResourceRef::cluster("standard");
        let created = store.create(&reference, json!({})).await.unwrap();

        let rename = created.mutate(|f| f["metadata"]["name"] = json!("other"));
        let current = store.patch(&reference, created.version(), &rename).await.unwrap();
        assert_eq!(current.field("/metadata/name"), Some(&json!("standard")));
        assert_eq!(current.version(), created.version());
    }

    #[tokio::test]
    async fn test_update_conditional_and_unconditional() {
        let store = store();
        let reference = ResourceRef::cluster("standard");
        let created = store.create(&reference, json!({"a": 1})).await.unwrap();

        let v2 = store
            .update(&reference, Some(created.version()), json!({"a": 2}))
            .await
            .unwrap();
        let err = store
            .update(&reference, Some(created.version()), json!({"a": 3}))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let v3 = store.update(&reference, None, json!({"a": 4})).await.unwrap();
        assert!(v3.version() > v2.version());
        assert_eq!(v3.uid(), created.uid());
        assert_eq!(
            v3.field("/metadata/creationTimestamp"),
            created.field("/metadata/creationTimestamp")
        );
    }

    #[tokio::test]
    async fn test_delete_emits_tombstone() {
        let store = store();
        let reference = ResourceRef::cluster("standard");
        let created = store.create(&reference, json!({})).await.unwrap();
        let with_note = created.mutate(|f| set_annotation(f, "note", "bye"));
        store.patch(&reference, created.version(), &with_note).await.unwrap();

        let mut events = store.subscribe();
        store.delete(&reference).await.unwrap();

        match events.recv().await.unwrap() {
            WatchEvent::Deleted(s) => {
                assert!(s.is_tombstone());
                assert_eq!(s.annotation("note"), Some("bye"));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(store.get(&reference).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&reference).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_collection_by_label() {
        let store = store();
        let mut labelled = json!({});
        crate::resource::set_label(&mut labelled, "test-obj", "true");

        store
            .create(&ResourceRef::cluster("a"), labelled.clone())
            .await
            .unwrap();
        store
            .create(&ResourceRef::cluster("b"), labelled)
            .await
            .unwrap();
        store
            .create(&ResourceRef::cluster("c"), json!({}))
            .await
            .unwrap();

        let removed = store
            .delete_collection(&LabelSelector::has_labels(["test-obj"]))
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let left = store.list(&LabelSelector::everything()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].reference(), &ResourceRef::cluster("c"));
    }

    #[tokio::test]
    async fn test_list_selector_matching_value() {
        let store = store();
        let mut gold = json!({});
        crate::resource::set_label(&mut gold, "tier", "gold");
        let mut silver = json!({});
        crate::resource::set_label(&mut silver, "tier", "silver");
        store.create(&ResourceRef::cluster("g"), gold).await.unwrap();
        store.create(&ResourceRef::cluster("s"), silver).await.unwrap();

        let found = store
            .list(&LabelSelector::everything().matching("tier", "gold"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].reference().name, "g");
    }
}
