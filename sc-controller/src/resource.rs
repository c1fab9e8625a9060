//! Resource identity and point-in-time views.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::patch::PatchOp;

/// Type of object a store and dispatcher operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind(&'static str);

impl ResourceKind {
    pub const STORAGE_CLASS: ResourceKind = ResourceKind("StorageClass");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identifies one resource instance. Used as the key for every lookup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    /// Reference to a cluster-scoped resource.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Reference to a namespaced resource.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Optimistic-concurrency token assigned by the authoritative store.
///
/// Callers treat it as opaque: the only meaningful operations are equality
/// (is this still the version I read?) and ordering (has a read caught up
/// with a write?).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a reconcile round was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Create => f.write_str("create"),
            Reason::Update => f.write_str("update"),
            Reason::Delete => f.write_str("delete"),
        }
    }
}

/// Immutable point-in-time view of one resource.
///
/// The field tree is shared behind an `Arc`, so cloning a snapshot is cheap
/// and no holder can change what another holder observes.
#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    reference: ResourceRef,
    uid: String,
    version: Version,
    fields: Arc<Value>,
    deleted: bool,
}

impl ResourceSnapshot {
    pub fn new(reference: ResourceRef, uid: String, version: Version, fields: Value) -> Self {
        Self {
            reference,
            uid,
            version,
            fields: Arc::new(fields),
            deleted: false,
        }
    }

    pub(crate) fn from_shared(
        reference: ResourceRef,
        uid: String,
        version: Version,
        fields: Arc<Value>,
    ) -> Self {
        Self {
            reference,
            uid,
            version,
            fields,
            deleted: false,
        }
    }

    /// Turn this view into a tombstone carrying the last known fields.
    pub fn into_tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    pub fn reference(&self) -> &ResourceRef {
        &self.reference
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn fields(&self) -> &Value {
        &self.fields
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Look up a field by JSON pointer (`/spec/provisioner`).
    pub fn field(&self, pointer: &str) -> Option<&Value> {
        self.fields.pointer(pointer)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        string_entry(&self.fields, "annotations", key)
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(&self.fields, "annotations")
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        string_entry(&self.fields, "labels", key)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(&self.fields, "labels")
    }

    /// Apply `mutate` to a private copy of the fields and return the merge
    /// patch that turns this snapshot into the mutated copy.
    pub fn mutate(&self, mutate: impl FnOnce(&mut Value)) -> PatchOp {
        let mut desired = self.fields.as_ref().clone();
        mutate(&mut desired);
        PatchOp::diff(&self.fields, &desired)
    }
}

/// Set `metadata.annotations[key]`, creating the intermediate maps.
pub fn set_annotation(fields: &mut Value, key: impl Into<String>, value: impl Into<String>) {
    metadata_map(fields, "annotations").insert(key.into(), Value::String(value.into()));
}

/// Set `metadata.labels[key]`, creating the intermediate maps.
pub fn set_label(fields: &mut Value, key: impl Into<String>, value: impl Into<String>) {
    metadata_map(fields, "labels").insert(key.into(), Value::String(value.into()));
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    match slot {
        Value::Object(inner) => inner,
        _ => unreachable!("slot was just replaced with an object"),
    }
}

fn metadata_map<'a>(fields: &'a mut Value, section: &str) -> &'a mut Map<String, Value> {
    if !fields.is_object() {
        *fields = Value::Object(Map::new());
    }
    let Value::Object(root) = fields else {
        unreachable!("fields was just replaced with an object");
    };
    let metadata = object_entry(root, "metadata");
    object_entry(metadata, section)
}

fn string_entry<'a>(fields: &'a Value, section: &str, key: &str) -> Option<&'a str> {
    fields
        .get("metadata")?
        .get(section)?
        .get(key)?
        .as_str()
}

fn string_map(fields: &Value, section: &str) -> BTreeMap<String, String> {
    fields
        .get("metadata")
        .and_then(|m| m.get(section))
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// One unit of reconcile work, built from a watch notification.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub reference: ResourceRef,
    pub reason: Reason,
    pub snapshot: ResourceSnapshot,
}

impl ReconcileRequest {
    pub fn new(reason: Reason, snapshot: ResourceSnapshot) -> Self {
        Self {
            reference: snapshot.reference().clone(),
            reason,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(fields: Value) -> ResourceSnapshot {
        ResourceSnapshot::new(
            ResourceRef::cluster("standard"),
            "uid-1".to_string(),
            Version::from_raw(3),
            fields,
        )
    }

    #[test]
    fn test_ref_display() {
        assert_eq!(ResourceRef::cluster("fast").to_string(), "fast");
        assert_eq!(ResourceRef::namespaced("ns", "fast").to_string(), "ns/fast");
    }

    #[test]
    fn test_annotation_lookup_with_slash_key() {
        let snap = snapshot(json!({
            "metadata": {"annotations": {"kubeblocks.io/test": "test"}}
        }));
        assert_eq!(snap.annotation("kubeblocks.io/test"), Some("test"));
        assert_eq!(snap.annotation("missing"), None);
        assert_eq!(snap.annotations().len(), 1);
    }

    #[test]
    fn test_accessors_on_absent_metadata() {
        let snap = snapshot(json!({"provisioner": "hostpath.csi.k8s.io"}));
        assert!(snap.annotations().is_empty());
        assert!(snap.labels().is_empty());
        assert_eq!(snap.label("app"), None);
        assert_eq!(
            snap.field("/provisioner"),
            Some(&json!("hostpath.csi.k8s.io"))
        );
    }

    #[test]
    fn test_mutate_leaves_snapshot_untouched() {
        let snap = snapshot(json!({"metadata": {"name": "standard"}}));
        let patch = snap.mutate(|fields| set_annotation(fields, "k", "v"));

        assert_eq!(
            patch.as_value(),
            &json!({"metadata": {"annotations": {"k": "v"}}})
        );
        assert_eq!(snap.annotation("k"), None);
    }

    #[test]
    fn test_set_label_replaces_non_object_metadata() {
        let mut fields = json!({"metadata": "garbage"});
        set_label(&mut fields, "tier", "gold");
        assert_eq!(fields, json!({"metadata": {"labels": {"tier": "gold"}}}));
    }

    #[test]
    fn test_tombstone_keeps_fields() {
        let snap = snapshot(json!({"metadata": {"labels": {"a": "b"}}})).into_tombstone();
        assert!(snap.is_tombstone());
        assert_eq!(snap.label("a"), Some("b"));
    }
}
