//! Typed view of the StorageClass resource.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::resource::{ResourceRef, ResourceSnapshot};

/// Annotation marking the cluster's default StorageClass.
pub const IS_DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Delete,
    Retain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeBindingMode {
    Immediate,
    WaitForFirstConsumer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    pub metadata: ObjectMeta,
    pub provisioner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaim_policy: Option<ReclaimPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_binding_mode: Option<VolumeBindingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_volume_expansion: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl StorageClass {
    pub fn new(name: impl Into<String>, provisioner: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            provisioner: provisioner.into(),
            reclaim_policy: None,
            volume_binding_mode: None,
            allow_volume_expansion: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef {
            namespace: self.metadata.namespace.clone(),
            name: self.metadata.name.clone(),
        }
    }

    pub fn is_default_class(&self) -> bool {
        self.metadata
            .annotations
            .get(IS_DEFAULT_CLASS_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    pub fn into_fields(self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_snapshot(snapshot: &ResourceSnapshot) -> Result<Self> {
        Ok(Self::deserialize(snapshot.fields())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Version;
    use serde_json::json;

    #[test]
    fn test_parse_manifest() {
        let fields = json!({
            "apiVersion": "storage.k8s.io/v1",
            "kind": "StorageClass",
            "metadata": {
                "name": "standard-abc",
                "uid": "ignored",
                "annotations": {IS_DEFAULT_CLASS_ANNOTATION: "true"}
            },
            "provisioner": "hostpath.csi.k8s.io",
            "reclaimPolicy": "Delete",
            "volumeBindingMode": "Immediate",
            "allowVolumeExpansion": true
        });
        let snapshot = ResourceSnapshot::new(
            ResourceRef::cluster("standard-abc"),
            "uid".to_string(),
            Version::from_raw(1),
            fields,
        );

        let sc = StorageClass::from_snapshot(&snapshot).unwrap();
        assert_eq!(sc.metadata.name, "standard-abc");
        assert_eq!(sc.reclaim_policy, Some(ReclaimPolicy::Delete));
        assert_eq!(sc.volume_binding_mode, Some(VolumeBindingMode::Immediate));
        assert_eq!(sc.allow_volume_expansion, Some(true));
        assert!(sc.is_default_class());
        assert_eq!(sc.reference(), ResourceRef::cluster("standard-abc"));
    }

    #[test]
    fn test_into_fields_omits_unset() {
        let fields = StorageClass::new("fast", "ebs.csi.aws.com")
            .into_fields()
            .unwrap();
        assert_eq!(
            fields,
            json!({"metadata": {"name": "fast"}, "provisioner": "ebs.csi.aws.com"})
        );
    }

    #[test]
    fn test_missing_provisioner_is_an_error() {
        let snapshot = ResourceSnapshot::new(
            ResourceRef::cluster("broken"),
            "uid".to_string(),
            Version::from_raw(1),
            json!({"metadata": {"name": "broken"}}),
        );
        assert!(StorageClass::from_snapshot(&snapshot).is_err());
    }
}
