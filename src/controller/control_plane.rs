//! Reconciliation of a whole ServiceMeshControlPlane
//!
//! Drives the component reconciler over every rendered component in priority
//! order, aggregates the top-level status and persists it, and tears the
//! installation down when the resource is deleted.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::client::ClusterClient;
use super::component::ComponentReconciler;
use super::conditions::{deletion_confirmed, is_deleted, update_reconcile_conditions};
use super::finalizers::{
    add_finalizer, control_plane_key, has_finalizer, is_being_deleted, remove_finalizer,
    FINALIZER_REMOVAL_ATTEMPTS,
};
use super::hooks::HookRegistry;
use super::manifest::{Manifest, ManifestRenderer, RenderedManifests};
use super::object::{ObjectReconciler, ReconcileContext};
use super::patch::PatchFactory;
use crate::crd::{ComponentStatus, ControlPlaneStatus, ResourceKey, ServiceMeshControlPlane};
use crate::error::{AggregateError, Result};
use crate::retry::{poll_until, RetryConfig};

/// Components installed first, in this order, when they are rendered
pub const DEFAULT_COMPONENT_ORDER: &[&str] = &[
    "istio",
    "istio/charts/security",
    "istio/charts/galley",
    "istio/charts/prometheus",
    "istio/charts/mixer",
    "istio/charts/pilot",
    "istio/charts/gateways",
    "istio/charts/sidecarInjectorWebhook",
    "istio/charts/grafana",
    "istio/charts/tracing",
    "istio/charts/kiali",
];

/// Installation priority of components
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentOrder(Vec<String>);

impl Default for ComponentOrder {
    fn default() -> Self {
        Self(DEFAULT_COMPONENT_ORDER.iter().map(|s| s.to_string()).collect())
    }
}

impl ComponentOrder {
    pub fn new(priority: Vec<String>) -> Self {
        Self(priority)
    }

    pub fn priority(&self) -> &[String] {
        &self.0
    }

    /// Components to visit in one pass
    ///
    /// Prioritized components that rendered come first, then the other
    /// rendered components by name, then components from the previous status
    /// that no longer render.
    pub fn sequence(&self, rendered: &RenderedManifests, previous: &ControlPlaneStatus) -> Vec<String> {
        let mut sequence: Vec<String> = Vec::new();
        let push = |name: &str, sequence: &mut Vec<String>| {
            if !sequence.iter().any(|s| s == name) {
                sequence.push(name.to_string());
            }
        };

        for name in self.0.iter().filter(|n| rendered.contains_key(n.as_str())) {
            push(name, &mut sequence);
        }
        for name in rendered.keys() {
            push(name, &mut sequence);
        }
        for component in &previous.component_status {
            push(&component.resource, &mut sequence);
        }
        sequence
    }
}

/// Optional wait for a component's Deployments after it is reconciled
#[derive(Clone, Debug)]
pub struct ReadinessConfig {
    pub wait_for: Vec<String>,
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            wait_for: Vec::new(),
            attempts: 10,
            interval: Duration::from_secs(6),
        }
    }
}

/// Options of the reconciliation engine
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub component_order: ComponentOrder,
    pub readiness: ReadinessConfig,
    /// Prefix of the mesh-generation annotation
    pub operator_version: String,
    pub finalizer_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            component_order: ComponentOrder::default(),
            readiness: ReadinessConfig::default(),
            operator_version: env!("CARGO_PKG_VERSION").to_string(),
            finalizer_retry: RetryConfig::with_max_attempts(FINALIZER_REMOVAL_ATTEMPTS),
        }
    }
}

/// What the controller should do after a pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Run again right away (the finalizer was just added)
    Requeue,
    Complete,
}

pub struct ControlPlaneReconciler {
    client: Arc<dyn ClusterClient>,
    renderer: Arc<dyn ManifestRenderer>,
    components: ComponentReconciler,
    config: EngineConfig,
}

impl ControlPlaneReconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        renderer: Arc<dyn ManifestRenderer>,
        patch_factory: Arc<dyn PatchFactory>,
        hooks: Arc<HookRegistry>,
        config: EngineConfig,
    ) -> Self {
        let objects = ObjectReconciler::new(client.clone(), patch_factory, hooks);
        Self {
            client,
            renderer,
            components: ComponentReconciler::new(objects),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[instrument(skip_all, fields(name = %instance.name_any(), namespace = instance.namespace()))]
    pub async fn reconcile(&self, instance: &ServiceMeshControlPlane) -> Result<ReconcileOutcome> {
        if is_being_deleted(instance) {
            if has_finalizer(instance) {
                self.delete(instance).await?;
            }
            return Ok(ReconcileOutcome::Complete);
        }

        if !has_finalizer(instance) {
            add_finalizer(self.client.as_ref(), instance).await?;
            return Ok(ReconcileOutcome::Requeue);
        }

        let previous = instance.status_or_default();
        let generation = instance.metadata.generation.unwrap_or_default();
        if generation == previous.status.observed_generation
            && previous.status.is_installed()
            && previous.status.is_reconciled()
        {
            debug!("Generation {} already reconciled", generation);
            return Ok(ReconcileOutcome::Complete);
        }

        info!("Reconciling ServiceMeshControlPlane generation {}", generation);
        let ctx = ReconcileContext::new(instance, &self.config.operator_version);
        let mut errors = AggregateError::new();
        let mut new_status = ControlPlaneStatus {
            status: previous.status.clone(),
            component_status: Vec::new(),
        };

        match self.renderer.render(instance).await {
            Ok(rendered) => {
                for name in self.config.component_order.sequence(&rendered, &previous) {
                    let manifests = rendered.get(&name).map(Vec::as_slice).unwrap_or_default();
                    let (component, result) = self
                        .components
                        .reconcile_component(&ctx, &name, manifests, previous.find_component(&name))
                        .await;

                    #[cfg(feature = "metrics")]
                    super::metrics::set_component_installed(
                        &ctx.namespace,
                        &instance.name_any(),
                        &name,
                        component.status.is_installed(),
                    );

                    match result {
                        Ok(()) if self.config.readiness.wait_for.contains(&name) => {
                            self.wait_for_component(&component).await;
                        }
                        Ok(()) => {}
                        Err(e) => errors.push(e),
                    }

                    if !manifests.iter().any(Manifest::is_yaml)
                        && component.resources.is_empty()
                        && is_deleted(&component.status)
                    {
                        info!("Component {} fully removed", name);
                        continue;
                    }
                    new_status.component_status.push(component);
                }
            }
            Err(e) => {
                warn!("Rendering failed: {}", e);
                errors.push(e);
                new_status.component_status = previous.component_status.clone();
            }
        }

        new_status.status.observed_generation = generation;
        let result = errors.into_result();
        update_reconcile_conditions(&mut new_status.status, result.as_ref().err());

        match (self.persist_status(instance, &new_status).await, result) {
            (Ok(()), Ok(())) => {
                info!("ServiceMeshControlPlane reconciled");
                Ok(ReconcileOutcome::Complete)
            }
            (Err(e), Ok(())) => Err(e),
            (persisted, Err(e)) => {
                if let Err(persist_error) = persisted {
                    warn!("Failed to persist status: {}", persist_error);
                }
                Err(e)
            }
        }
    }

    /// Delete every tracked object, newest component first, then release the
    /// resource by removing the finalizer
    ///
    /// Deletion failures are logged and never keep the finalizer in place.
    #[instrument(skip_all, fields(name = %instance.name_any(), namespace = instance.namespace()))]
    pub async fn delete(&self, instance: &ServiceMeshControlPlane) -> Result<()> {
        if !has_finalizer(instance) {
            return Ok(());
        }

        info!("Deleting ServiceMeshControlPlane installation");
        let ctx = ReconcileContext::new(instance, &self.config.operator_version);
        let status = instance.status_or_default();

        for component in status.component_status.iter().rev() {
            debug!("Deleting component {}", component.resource);
            for resource in component.resources.iter().rev() {
                if deletion_confirmed(&resource.status) {
                    continue;
                }
                if let Err(e) = self
                    .components
                    .delete_resource(&ctx, &resource.resource)
                    .await
                {
                    warn!("Failed to delete {}: {}", resource.resource, e);
                }
            }
        }

        remove_finalizer(
            self.client.as_ref(),
            instance,
            &self.config.finalizer_retry,
        )
        .await
    }

    async fn persist_status(
        &self,
        instance: &ServiceMeshControlPlane,
        status: &ControlPlaneStatus,
    ) -> Result<()> {
        let body = json!({ "status": status });
        self.client
            .patch_status(&control_plane_key(instance), &body)
            .await?;
        Ok(())
    }

    async fn wait_for_component(&self, component: &ComponentStatus) {
        let deployments: Vec<ResourceKey> = component
            .resources
            .iter()
            .filter(|r| r.resource.kind == "Deployment" && !is_deleted(&r.status))
            .map(|r| r.resource.clone())
            .collect();
        if deployments.is_empty() {
            return;
        }

        let readiness = &self.config.readiness;
        let client = self.client.as_ref();
        let deployments = &deployments;
        let ready = poll_until(
            &RetryConfig::fixed(readiness.attempts, readiness.interval),
            &component.resource,
            || async move {
                for key in deployments {
                    if !deployment_ready(&client.get(key).await?.data) {
                        return Ok(false);
                    }
                }
                Ok(true)
            },
        )
        .await;

        if ready {
            info!("Component {} is ready", component.resource);
        } else {
            warn!(
                "Component {} did not become ready after {} attempts",
                component.resource, readiness.attempts
            );
        }
    }
}

fn deployment_ready(deployment: &serde_json::Value) -> bool {
    let desired = deployment["spec"]["replicas"].as_i64().unwrap_or(1);
    let ready = deployment["status"]["readyReplicas"].as_i64().unwrap_or(0);
    ready >= desired
}
