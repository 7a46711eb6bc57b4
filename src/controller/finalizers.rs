//! Finalizer handling for ServiceMeshControlPlane teardown
//!
//! The finalizer is added before anything is installed so that deleting a
//! control plane always gives the operator a chance to remove every object it
//! tracked, including those outside the control plane namespace that owner
//! references cannot reach.

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::info;

use super::client::ClusterClient;
use crate::crd::{
    ResourceKey, ServiceMeshControlPlane, CONTROL_PLANE_GROUP, CONTROL_PLANE_KIND,
    CONTROL_PLANE_VERSION,
};
use crate::error::{Error, Result};
use crate::retry::{retry_on_conflict, RetryConfig};

/// Finalizer name used to protect ServiceMeshControlPlane resources
pub const CONTROL_PLANE_FINALIZER: &str = "maistra.io/istio-operator";

/// Attempts spent on removing the finalizer before giving up
pub const FINALIZER_REMOVAL_ATTEMPTS: u32 = 5;

/// Identity of a control plane resource
pub fn control_plane_key(smcp: &ServiceMeshControlPlane) -> ResourceKey {
    ResourceKey::new(
        CONTROL_PLANE_GROUP,
        CONTROL_PLANE_VERSION,
        CONTROL_PLANE_KIND,
        smcp.namespace().unwrap_or_default(),
        smcp.name_any(),
    )
}

/// Untyped copy of a control plane, as sent through the cluster client
pub fn to_dynamic(smcp: &ServiceMeshControlPlane) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(smcp)?)?)
}

pub fn from_dynamic(obj: DynamicObject) -> Result<ServiceMeshControlPlane> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// A deletion timestamp means deletion was requested and finalizers are pending
pub fn is_being_deleted(smcp: &ServiceMeshControlPlane) -> bool {
    smcp.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(smcp: &ServiceMeshControlPlane) -> bool {
    smcp.finalizers()
        .iter()
        .any(|f| f == CONTROL_PLANE_FINALIZER)
}

/// Add the finalizer; a stale resourceVersion surfaces as a conflict
pub async fn add_finalizer(client: &dyn ClusterClient, smcp: &ServiceMeshControlPlane) -> Result<()> {
    if has_finalizer(smcp) {
        return Ok(());
    }
    let mut obj = to_dynamic(smcp)?;
    obj.finalizers_mut().push(CONTROL_PLANE_FINALIZER.to_string());
    client.update(&obj).await?;
    info!(
        "Added finalizer to ServiceMeshControlPlane: {}",
        smcp.name_any()
    );
    Ok(())
}

/// Remove the finalizer, re-reading the resource before every attempt
pub async fn remove_finalizer(
    client: &dyn ClusterClient,
    smcp: &ServiceMeshControlPlane,
    retry: &RetryConfig,
) -> Result<()> {
    let key = control_plane_key(smcp);
    let key = &key;
    retry_on_conflict(retry, "remove finalizer", || async move {
        let mut current = match client.get(key).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        let before = current.finalizers().len();
        current
            .finalizers_mut()
            .retain(|f| f != CONTROL_PLANE_FINALIZER);
        if current.finalizers().len() == before {
            return Ok(());
        }
        client.update(&current).await?;
        Ok(())
    })
    .await
    .map_err(|e| {
        if e.is_conflict() {
            Error::FinalizerError(format!("could not remove finalizer from {}: {}", key, e))
        } else {
            e
        }
    })?;

    info!(
        "Removed finalizer from ServiceMeshControlPlane: {}",
        smcp.name_any()
    );
    Ok(())
}
