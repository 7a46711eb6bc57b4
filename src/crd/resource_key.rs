//! Identity of a live cluster object
//!
//! A [`ResourceKey`] is a plain value (group, version, kind, namespace, name)
//! so it can be stored in the status tree and used as a map key.

use std::fmt;

use kube::api::{DynamicObject, ObjectMeta, TypeMeta};
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifies a live object in the cluster
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Empty for cluster-scoped kinds
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

/// API group and kind, used to dispatch hooks
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Split an `apiVersion` into group and version (`v1` belongs to the core group)
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

impl ResourceKey {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Derive the key of an API object
    ///
    /// Fails when the object carries no `apiVersion`/`kind` or no name.
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::ManifestError(format!(
                "object {:?} has no apiVersion/kind",
                obj.metadata.name
            ))
        })?;
        if types.kind.is_empty() || types.api_version.is_empty() {
            return Err(Error::ManifestError(format!(
                "object {:?} has an empty apiVersion or kind",
                obj.metadata.name
            )));
        }
        let name = obj
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::ManifestError(format!("{} object has no metadata.name", types.kind))
            })?;
        let (group, version) = split_api_version(&types.api_version);

        Ok(Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: types.kind.clone(),
            namespace: obj.namespace().unwrap_or_default(),
            name,
        })
    }

    /// `group/version`, or just `version` for the core group
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Build an empty object carrying only this identity, usable for get/delete
    pub fn to_placeholder(&self) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: self.api_version(),
                kind: self.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: if self.namespace.is_empty() {
                    None
                } else {
                    Some(self.namespace.clone())
                },
                ..Default::default()
            },
            data: serde_json::Value::Object(Default::default()),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version(), self.kind, self.name)
        } else {
            write!(
                f,
                "{}/{} {}/{}",
                self.api_version(),
                self.kind,
                self.namespace,
                self.name
            )
        }
    }
}
