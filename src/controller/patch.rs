//! Patch/diff engine
//!
//! Decides whether a live object has drifted from its desired state and, if
//! so, produces a three-way JSON merge patch:
//! - fields set in desired that differ from live are written,
//! - fields that were last applied by us but are no longer desired are removed,
//! - fields only the server populates (and status) are left alone.
//!
//! Nothing touches the cluster until [`ObjectPatch::apply`] is called.

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use super::client::ClusterClient;
use crate::crd::ResourceKey;
use crate::error::{Error, Result};

/// Annotation recording the configuration last sent to the cluster
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

const SERVER_METADATA_FIELDS: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "generation",
    "creationTimestamp",
    "uid",
    "selfLink",
];

/// Computes the mutation that brings a live object to its desired state
pub trait PatchFactory: Send + Sync {
    /// `Ok(None)` when the desired state is already met
    fn create_patch(
        &self,
        current: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<Option<ObjectPatch>>;
}

/// A computed merge patch, ready to be sent
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectPatch {
    key: ResourceKey,
    body: Value,
}

impl ObjectPatch {
    pub fn new(key: ResourceKey, body: Value) -> Self {
        Self { key, body }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub async fn apply(&self, client: &dyn ClusterClient) -> Result<DynamicObject> {
        client.patch(&self.key, &self.body).await
    }
}

/// Default [`PatchFactory`], using the last-applied annotation as the
/// common ancestor
#[derive(Clone, Debug, Default)]
pub struct ThreeWayMergePatchFactory;

impl PatchFactory for ThreeWayMergePatchFactory {
    fn create_patch(
        &self,
        current: &DynamicObject,
        desired: &DynamicObject,
    ) -> Result<Option<ObjectPatch>> {
        let current_key = ResourceKey::from_object(current)?;
        let desired_key = ResourceKey::from_object(desired)?;
        if current_key.group != desired_key.group
            || current_key.kind != desired_key.kind
            || current_key.namespace != desired_key.namespace
            || current_key.name != desired_key.name
        {
            return Err(Error::PatchError(format!(
                "cannot patch {} into {}",
                desired_key, current_key
            )));
        }

        let original = last_applied(current)?.map(|v| strip_server_fields(v));
        let live = strip_server_fields(serde_json::to_value(current)?);
        let wanted = strip_server_fields(serde_json::to_value(desired)?);

        let (Some(live), Some(wanted)) = (live.as_object(), wanted.as_object()) else {
            return Err(Error::PatchError(format!(
                "{} did not serialize to an object",
                desired_key
            )));
        };

        let body = diff_object(
            original.as_ref().and_then(Value::as_object),
            Some(live),
            wanted,
        );
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(ObjectPatch::new(desired_key, Value::Object(body))))
        }
    }
}

/// Record the desired configuration on the object itself for later diffs
pub fn stamp_last_applied(obj: &mut DynamicObject) -> Result<()> {
    let mut snapshot = obj.clone();
    if let Some(annotations) = snapshot.metadata.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
        if annotations.is_empty() {
            snapshot.metadata.annotations = None;
        }
    }
    let mut value = serde_json::to_value(&snapshot)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
    }
    let encoded = serde_json::to_string(&value)?;
    obj.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(LAST_APPLIED_ANNOTATION.to_string(), encoded);
    Ok(())
}

fn last_applied(obj: &DynamicObject) -> Result<Option<Value>> {
    let Some(raw) = obj
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
    else {
        return Ok(None);
    };
    serde_json::from_str(raw).map(Some).map_err(|e| {
        Error::PatchError(format!(
            "unparsable {} annotation on {:?}: {}",
            LAST_APPLIED_ANNOTATION, obj.metadata.name, e
        ))
    })
}

fn strip_server_fields(mut value: Value) -> Value {
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        map.remove("apiVersion");
        map.remove("kind");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA_FIELDS {
                meta.remove(*field);
            }
        }
    }
    value
}

fn diff_object(
    original: Option<&Map<String, Value>>,
    current: Option<&Map<String, Value>>,
    desired: &Map<String, Value>,
) -> Map<String, Value> {
    let mut patch = Map::new();

    for (key, wanted) in desired {
        let live = current.and_then(|c| c.get(key));
        match (wanted, live) {
            (Value::Null, Some(Value::Null) | None) => {}
            (Value::Object(wanted), Some(Value::Object(live))) => {
                let ancestor = original.and_then(|o| o.get(key)).and_then(Value::as_object);
                let nested = diff_object(ancestor, Some(live), wanted);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            (Value::Array(_), Some(live @ Value::Array(_)))
                if covers(original.and_then(|o| o.get(key)), live, wanted) => {}
            (wanted, Some(live)) if wanted == live => {}
            (wanted, _) => {
                patch.insert(key.clone(), wanted.clone());
            }
        }
    }

    if let Some(original) = original {
        for key in original.keys() {
            let still_live = current.map_or(false, |c| c.contains_key(key));
            if !desired.contains_key(key) && still_live {
                patch.insert(key.clone(), Value::Null);
            }
        }
    }

    patch
}

/// Whether `live` already holds everything in `desired`
///
/// Fields the server filled in (defaults inside list elements) do not count as
/// drift, but a field dropped since `original` that is still live does.
fn covers(original: Option<&Value>, live: &Value, desired: &Value) -> bool {
    match (desired, live) {
        (Value::Object(desired), Value::Object(live)) => {
            let original = original.and_then(Value::as_object);
            let wanted_present = desired.iter().all(|(key, wanted)| match (wanted, live.get(key)) {
                (Value::Null, None | Some(Value::Null)) => true,
                (_, None) => false,
                (wanted, Some(live)) => covers(original.and_then(|o| o.get(key)), live, wanted),
            });
            let removed_gone = original.map_or(true, |o| {
                o.keys()
                    .all(|key| desired.contains_key(key) || !live.contains_key(key))
            });
            wanted_present && removed_gone
        }
        (Value::Array(desired), Value::Array(live)) => {
            let original = original.and_then(Value::as_array);
            desired.len() == live.len()
                && desired.iter().zip(live).enumerate().all(|(i, (wanted, live))| {
                    covers(original.and_then(|o| o.get(i)), live, wanted)
                })
        }
        (desired, live) => desired == live,
    }
}
