//! Controller loop for ServiceMeshControlPlane resources
//!
//! Wires the reconciliation engine into a kube-runtime `Controller`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    runtime::{controller::Action, watcher::Config, Controller},
    Client, ResourceExt,
};
use tracing::{debug, error, info};

use super::control_plane::{ControlPlaneReconciler, ReconcileOutcome};
use crate::crd::ServiceMeshControlPlane;
use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Delay before the pass that follows adding the finalizer
const REQUEUE_AFTER_FINALIZER: Duration = Duration::from_secs(1);
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(10);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub engine: Arc<ControlPlaneReconciler>,
    /// Watch a single namespace instead of the whole cluster
    pub namespace: Option<String>,
    /// Periodic resync of reconciled control planes
    pub resync_interval: Duration,
    /// Set while this replica holds the leader lease
    pub is_leader: Arc<AtomicBool>,
}

impl ControllerState {
    /// Api scoped to the watched namespace, or to the whole cluster
    pub fn control_planes(&self) -> Api<ServiceMeshControlPlane> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let control_planes = state.control_planes();

    info!(
        namespace = state.namespace.as_deref().unwrap_or("*"),
        "Starting ServiceMeshControlPlane controller"
    );

    // Verify CRD exists
    let api = &control_planes;
    match retry_with_backoff(&RetryConfig::default(), "list control planes", || async move {
        api.list(&ListParams::default().limit(1))
            .await
            .map_err(Error::from)
    })
    .await
    {
        Ok(_) => info!("ServiceMeshControlPlane CRD is available"),
        Err(e) => {
            error!(
                "ServiceMeshControlPlane CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "ServiceMeshControlPlane CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(control_planes, Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled: {}", obj),
                Err(e) => error!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

async fn reconcile(smcp: Arc<ServiceMeshControlPlane>, ctx: Arc<ControllerState>) -> Result<Action> {
    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping {}", smcp.name_any());
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    let result = ctx.engine.reconcile(&smcp).await;

    #[cfg(feature = "metrics")]
    {
        super::metrics::observe_reconcile_duration_seconds(
            "controlplane",
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = &result {
            super::metrics::inc_reconcile_error("controlplane", e.kind());
        }
    }

    Ok(next_action(result?, ctx.resync_interval))
}

fn next_action(outcome: ReconcileOutcome, resync_interval: Duration) -> Action {
    match outcome {
        ReconcileOutcome::Requeue => Action::requeue(REQUEUE_AFTER_FINALIZER),
        ReconcileOutcome::Complete if resync_interval.is_zero() => Action::await_change(),
        ReconcileOutcome::Complete => Action::requeue(resync_interval),
    }
}

fn error_policy(smcp: Arc<ServiceMeshControlPlane>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    error!("Reconciliation error for {}: {}", smcp.name_any(), error);
    Action::requeue(retry_delay(error))
}

/// Shorter retry for errors that are likely to clear on their own
fn retry_delay(error: &Error) -> Duration {
    if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    }
}
