//! Reconciliation of one control plane component
//!
//! A component is a named set of manifests. Every pass rebuilds the
//! component's status from scratch: objects still rendered are applied, objects
//! tracked in the previous status but no longer rendered are deleted in reverse
//! order, and entries whose deletion was already confirmed are dropped.

use std::collections::HashSet;

use kube::api::DeleteParams;
use tracing::{debug, info, instrument, warn};

use super::conditions::{is_deleted, update_delete_conditions, update_reconcile_conditions};
use super::hooks::HookContext;
use super::manifest::Manifest;
use super::object::{ObjectReconciler, ReconcileContext};
use crate::crd::{ComponentStatus, ResourceKey};
use crate::error::{AggregateError, Result};

pub struct ComponentReconciler {
    objects: ObjectReconciler,
}

impl ComponentReconciler {
    pub fn new(objects: ObjectReconciler) -> Self {
        Self { objects }
    }

    /// Reconcile a component and return its new status
    ///
    /// The status is returned even when the pass failed; the error is the
    /// aggregate of every object, decode and deletion failure. A component
    /// without any `.yaml` manifest is torn down.
    #[instrument(skip_all, fields(component = %name, manifests = manifests.len()))]
    pub async fn reconcile_component(
        &self,
        ctx: &ReconcileContext<'_>,
        name: &str,
        manifests: &[Manifest],
        old_status: Option<&ComponentStatus>,
    ) -> (ComponentStatus, Result<()>) {
        let empty = ComponentStatus::new(name);
        let old = old_status.unwrap_or(&empty);
        let delete_only = !manifests.iter().any(Manifest::is_yaml);

        let mut new_status = ComponentStatus::new(name);
        new_status.status = old.status.clone();
        let mut processed = HashSet::new();
        let mut errors = AggregateError::new();

        for manifest in manifests {
            if !manifest.is_yaml() {
                debug!("Skipping non-YAML manifest {}", manifest.name);
                continue;
            }
            for decoded in manifest.objects() {
                match decoded {
                    Ok(obj) => errors.collect(
                        self.objects
                            .reconcile_object(ctx, obj, &mut processed, old, &mut new_status)
                            .await,
                    ),
                    Err(e) => {
                        warn!("Could not decode {}: {}", manifest.name, e);
                        errors.push(e);
                    }
                }
            }
        }

        let mut removed = Vec::new();
        for resource in old.resources.iter().rev() {
            if processed.contains(&resource.resource) {
                continue;
            }
            if is_deleted(&resource.status) {
                debug!("Dropping status of deleted {}", resource.resource);
                continue;
            }

            let mut status = resource.clone();
            match self.delete_resource(ctx, &resource.resource).await {
                Ok(()) => {
                    status.status.observed_generation = 0;
                    update_delete_conditions(&mut status.status, None);
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", resource.resource, e);
                    update_delete_conditions(&mut status.status, Some(&e));
                    errors.push(e);
                }
            }
            removed.push(status);
        }
        new_status.resources.extend(removed.into_iter().rev());

        let result = errors.into_result();
        if delete_only {
            update_delete_conditions(&mut new_status.status, result.as_ref().err());
        } else {
            if let Some(generation) = ctx.instance.metadata.generation {
                new_status.status.observed_generation = generation;
            }
            update_reconcile_conditions(&mut new_status.status, result.as_ref().err());
        }

        (new_status, result)
    }

    /// Delete one object with foreground propagation; absence counts as success
    pub async fn delete_resource(&self, ctx: &ReconcileContext<'_>, key: &ResourceKey) -> Result<()> {
        match self
            .objects
            .client()
            .delete(key, &DeleteParams::foreground())
            .await
        {
            Ok(()) => {
                info!("Deleted {}", key);
                #[cfg(feature = "metrics")]
                super::metrics::inc_object_operation(&key.kind, "delete");
            }
            Err(e) if e.is_absent() => debug!("{} was already gone", key),
            Err(e) => return Err(e),
        }

        let hook_ctx = HookContext {
            client: self.objects.client(),
            instance: ctx.instance,
        };
        self.objects.hooks().post_delete(&hook_ctx, key).await;
        Ok(())
    }
}
