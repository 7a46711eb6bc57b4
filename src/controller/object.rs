//! Reconciliation of a single desired object
//!
//! Creates or patches one object, records its status in the component being
//! rebuilt, and runs the hooks for its kind. Failures are recorded against the
//! object and returned to the component reconciler for aggregation; they
//! never stop sibling objects.

use std::collections::HashSet;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::client::ClusterClient;
use super::conditions::update_reconcile_conditions;
use super::hooks::{HookContext, HookRegistry};
use super::patch::{stamp_last_applied, PatchFactory};
use crate::crd::{
    ComponentStatus, ConditionType, ResourceKey, ResourceStatus, ServiceMeshControlPlane,
};
use crate::error::{AggregateError, Error, Result};

/// Label naming the namespace of the owning control plane
pub const OWNER_LABEL: &str = "maistra.io/owner";
/// Label set on objects an owner reference cannot point from
pub const MEMBER_OF_LABEL: &str = "maistra.io/member-of";
/// `<operator version>-<control plane generation>` of the last pass that applied an object
pub const MESH_GENERATION_ANNOTATION: &str = "maistra.io/mesh-generation";

/// Per-pass facts shared by every object of a control plane
pub struct ReconcileContext<'a> {
    pub instance: &'a ServiceMeshControlPlane,
    pub namespace: String,
    pub mesh_generation: String,
}

impl<'a> ReconcileContext<'a> {
    pub fn new(instance: &'a ServiceMeshControlPlane, operator_version: &str) -> Self {
        Self {
            instance,
            namespace: instance.namespace().unwrap_or_default(),
            mesh_generation: format!(
                "{}-{}",
                operator_version,
                instance.metadata.generation.unwrap_or_default()
            ),
        }
    }
}

pub struct ObjectReconciler {
    client: Arc<dyn ClusterClient>,
    patch_factory: Arc<dyn PatchFactory>,
    hooks: Arc<HookRegistry>,
}

impl ObjectReconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        patch_factory: Arc<dyn PatchFactory>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        Self {
            client,
            patch_factory,
            hooks,
        }
    }

    pub fn client(&self) -> &dyn ClusterClient {
        self.client.as_ref()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Reconcile `desired` (or every item of a `List`) into the cluster
    ///
    /// Every processed key is added to `processed` and its status appended to
    /// `new_status`, whether or not the object could be applied.
    pub async fn reconcile_object(
        &self,
        ctx: &ReconcileContext<'_>,
        desired: DynamicObject,
        processed: &mut HashSet<ResourceKey>,
        old_status: &ComponentStatus,
        new_status: &mut ComponentStatus,
    ) -> Result<()> {
        let mut errors = AggregateError::new();
        let mut pending = vec![desired];

        while let Some(obj) = pending.pop() {
            if is_list(&obj) {
                match list_items(obj) {
                    Ok(items) => pending.extend(items.into_iter().rev()),
                    Err(e) => errors.push(e),
                }
                continue;
            }
            errors.collect(
                self.reconcile_single(ctx, obj, processed, old_status, new_status)
                    .await,
            );
        }

        errors.into_result()
    }

    async fn reconcile_single(
        &self,
        ctx: &ReconcileContext<'_>,
        mut desired: DynamicObject,
        processed: &mut HashSet<ResourceKey>,
        old_status: &ComponentStatus,
        new_status: &mut ComponentStatus,
    ) -> Result<()> {
        apply_bookkeeping(ctx, &mut desired);
        let key = ResourceKey::from_object(&desired)?;
        processed.insert(key.clone());

        let mut status = old_status
            .find_resource(&key)
            .cloned()
            .unwrap_or_else(|| ResourceStatus::new(key.clone()));

        let result = self.apply(ctx, &key, &mut desired, &mut status).await;
        update_reconcile_conditions(&mut status.status, result.as_ref().err());
        new_status.resources.push(status);
        result
    }

    #[instrument(skip_all, fields(resource = %key))]
    async fn apply(
        &self,
        ctx: &ReconcileContext<'_>,
        key: &ResourceKey,
        desired: &mut DynamicObject,
        status: &mut ResourceStatus,
    ) -> Result<()> {
        let hook_ctx = HookContext {
            client: self.client.as_ref(),
            instance: ctx.instance,
        };
        self.hooks.pre_apply(&hook_ctx, key, desired).await?;
        stamp_last_applied(desired)?;

        let current = match self.client.get(key).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                let created = self.client.create(desired).await?;
                status.status.observed_generation = created.metadata.generation.unwrap_or(1);
                info!("Created {}", key);
                #[cfg(feature = "metrics")]
                super::metrics::inc_object_operation(&key.kind, "create");
                self.hooks.post_create(&hook_ctx, key, &created).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.patch_factory.create_patch(&current, desired)? {
            Some(patch) => {
                status.status.remove_condition(ConditionType::Reconciled);
                let patched = patch.apply(self.client.as_ref()).await?;
                if let Some(generation) = patched.metadata.generation {
                    status.status.observed_generation = generation;
                }
                info!("Patched {}", key);
                #[cfg(feature = "metrics")]
                super::metrics::inc_object_operation(&key.kind, "patch");
            }
            None => {
                if let Some(generation) = current.metadata.generation {
                    status.status.observed_generation = generation;
                }
                debug!("{} is up to date", key);
            }
        }
        Ok(())
    }
}

/// Owner reference, owner label and generation annotation
fn apply_bookkeeping(ctx: &ReconcileContext<'_>, obj: &mut DynamicObject) {
    let owner_ref = ctx.instance.controller_owner_ref(&());
    let same_namespace = obj.namespace().as_deref() == Some(ctx.namespace.as_str());

    let labels = obj.labels_mut();
    labels.insert(OWNER_LABEL.to_string(), ctx.namespace.clone());

    match owner_ref {
        Some(owner) if same_namespace => {
            let refs = obj.owner_references_mut();
            refs.retain(|r| r.uid != owner.uid);
            refs.push(owner);
        }
        _ => {
            obj.labels_mut()
                .insert(MEMBER_OF_LABEL.to_string(), ctx.namespace.clone());
        }
    }

    obj.annotations_mut().insert(
        MESH_GENERATION_ANNOTATION.to_string(),
        ctx.mesh_generation.clone(),
    );
}

fn is_list(obj: &DynamicObject) -> bool {
    obj.types
        .as_ref()
        .map_or(false, |t| t.kind.ends_with("List"))
        && obj.data.get("items").map_or(false, Value::is_array)
}

fn list_items(mut list: DynamicObject) -> Result<Vec<DynamicObject>> {
    let Some(Value::Array(items)) = list.data.get_mut("items").map(Value::take) else {
        return Ok(Vec::new());
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item).map_err(|e| {
                Error::ManifestError(format!(
                    "item of list {:?} is not an object: {}",
                    list.metadata.name, e
                ))
            })
        })
        .collect()
}
