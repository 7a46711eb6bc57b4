//! In-memory cluster used by the engine tests
//!
//! Behaves like a tiny API server: objects get resourceVersions, generations
//! bump on non-metadata changes, stale updates conflict, and failures can be
//! injected per verb and object name. Every call is recorded so tests can
//! assert on the exact operations a pass produced.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject, PropagationPolicy};
use kube::core::GroupVersionKind;
use serde_json::Value;

use super::client::ClusterClient;
use crate::crd::ResourceKey;
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    PatchStatus,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Conflict,
    NotFound,
    Gone,
    Server,
}

impl Failure {
    fn to_error(self, name: &str) -> Error {
        match self {
            Failure::Conflict => Error::Conflict(format!("{} has been modified", name)),
            Failure::NotFound => Error::NotFound(name.to_string()),
            Failure::Gone => Error::Gone(name.to_string()),
            Failure::Server => Error::ConfigError(format!("injected failure for {}", name)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Op {
    pub verb: Verb,
    pub key: ResourceKey,
    pub propagation: Option<PropagationPolicy>,
}

struct Injected {
    verb: Verb,
    name: String,
    failure: Failure,
    remaining: Option<u32>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceKey, DynamicObject>,
    ops: Vec<Op>,
    failures: Vec<Injected>,
    next_version: u64,
}

#[derive(Default)]
pub struct FakeClusterClient {
    state: Mutex<State>,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object as if it already existed in the cluster
    pub fn insert(&self, mut obj: DynamicObject) -> DynamicObject {
        let key = ResourceKey::from_object(&obj).expect("seeded object needs an identity");
        let mut state = self.state.lock().unwrap();
        state.next_version += 1;
        obj.metadata.resource_version = Some(state.next_version.to_string());
        if obj.metadata.generation.is_none() {
            obj.metadata.generation = Some(1);
        }
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", key.name));
        }
        state.objects.insert(key, obj.clone());
        obj
    }

    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().unwrap().objects.contains_key(key)
    }

    /// Fail every call of `verb` against objects named `name`
    pub fn fail(&self, verb: Verb, name: &str, failure: Failure) {
        self.push_failure(verb, name, failure, None);
    }

    /// Fail the next `times` calls of `verb` against objects named `name`
    pub fn fail_times(&self, verb: Verb, name: &str, failure: Failure, times: u32) {
        self.push_failure(verb, name, failure, Some(times));
    }

    fn push_failure(&self, verb: Verb, name: &str, failure: Failure, remaining: Option<u32>) {
        self.state.lock().unwrap().failures.push(Injected {
            verb,
            name: name.to_string(),
            failure,
            remaining,
        });
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn ops_with(&self, verb: Verb) -> Vec<Op> {
        self.ops().into_iter().filter(|op| op.verb == verb).collect()
    }

    /// Number of mutating calls (create, update, patch, delete) recorded
    pub fn mutations(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| {
                matches!(
                    op.verb,
                    Verb::Create | Verb::Update | Verb::Patch | Verb::Delete
                )
            })
            .count()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    fn record(
        state: &mut State,
        verb: Verb,
        key: &ResourceKey,
        propagation: Option<PropagationPolicy>,
    ) -> Result<()> {
        state.ops.push(Op {
            verb,
            key: key.clone(),
            propagation,
        });
        let hit = state
            .failures
            .iter_mut()
            .find(|f| f.verb == verb && f.name == key.name && f.remaining != Some(0));
        if let Some(injected) = hit {
            if let Some(remaining) = injected.remaining.as_mut() {
                *remaining -= 1;
            }
            return Err(injected.failure.to_error(&key.name));
        }
        Ok(())
    }

    fn bump(state: &mut State, obj: &mut DynamicObject) {
        state.next_version += 1;
        obj.metadata.resource_version = Some(state.next_version.to_string());
    }
}

/// RFC 7386 JSON merge patch
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            let map = target.as_object_mut().expect("target is an object");
            for (k, v) in entries {
                if v.is_null() {
                    map.remove(k);
                } else {
                    apply_merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn spec_part(value: &Value) -> Value {
    let mut copy = value.clone();
    if let Some(map) = copy.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    copy
}

fn labels_match(obj: &DynamicObject, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .filter(|s| !s.is_empty())
        .all(|pair| match pair.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => labels.contains_key(pair),
        })
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Verb::Get, key, None)?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.group == gvk.group && k.version == gvk.version && k.kind == gvk.kind)
            .filter(|(k, _)| namespace.map_or(true, |ns| k.namespace == ns))
            .filter(|(_, o)| labels_match(o, label_selector))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj)?;
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Verb::Create, &key, None)?;
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{} already exists", key)));
        }
        let mut created = obj.clone();
        created.metadata.generation = Some(1);
        created.metadata.uid = Some(format!("uid-{}", key.name));
        Self::bump(&mut state, &mut created);
        state.objects.insert(key, created.clone());
        Ok(created)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj)?;
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Verb::Update, &key, None)?;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(Error::Conflict(format!("{} has been modified", key)));
        }
        let mut updated = obj.clone();
        let changed = spec_part(&serde_json::to_value(&current)?)
            != spec_part(&serde_json::to_value(&updated)?);
        let generation = current.metadata.generation.unwrap_or(1);
        updated.metadata.generation = Some(if changed { generation + 1 } else { generation });
        updated.metadata.uid = current.metadata.uid.clone();
        Self::bump(&mut state, &mut updated);
        state.objects.insert(key, updated.clone());
        Ok(updated)
    }

    async fn patch(&self, key: &ResourceKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Verb::Patch, key, None)?;
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let before = serde_json::to_value(&current)?;
        let mut after = before.clone();
        apply_merge_patch(&mut after, patch);
        let mut patched: DynamicObject = serde_json::from_value(after.clone())?;
        let generation = current.metadata.generation.unwrap_or(1);
        patched.metadata.generation = Some(if spec_part(&before) != spec_part(&after) {
            generation + 1
        } else {
            generation
        });
        Self::bump(&mut state, &mut patched);
        state.objects.insert(key.clone(), patched.clone());
        Ok(patched)
    }

    async fn patch_status(&self, key: &ResourceKey, patch: &Value) -> Result<DynamicObject> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Verb::PatchStatus, key, None)?;
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        let mut value = serde_json::to_value(&current)?;
        if let Some(status) = patch.get("status") {
            apply_merge_patch(
                value
                    .as_object_mut()
                    .expect("objects serialize to maps")
                    .entry("status")
                    .or_insert(Value::Null),
                status,
            );
        }
        let mut patched: DynamicObject = serde_json::from_value(value)?;
        Self::bump(&mut state, &mut patched);
        state.objects.insert(key.clone(), patched.clone());
        Ok(patched)
    }

    async fn delete(&self, key: &ResourceKey, params: &DeleteParams) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(
            &mut state,
            Verb::Delete,
            key,
            params.propagation_policy.clone(),
        )?;
        state
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

/// A control plane as the API server would hand it to the controller
pub fn control_plane(name: &str, namespace: &str) -> crate::crd::ServiceMeshControlPlane {
    let mut smcp = crate::crd::ServiceMeshControlPlane::new(name, Default::default());
    smcp.metadata.namespace = Some(namespace.to_string());
    smcp.metadata.uid = Some(format!("uid-{}", name));
    smcp.metadata.generation = Some(1);
    smcp
}

pub fn object(value: Value) -> DynamicObject {
    serde_json::from_value(value).expect("test object must decode")
}
