//! Controller module for ServiceMeshControlPlane reconciliation
//!
//! The engine is layered: [`ObjectReconciler`] applies single objects,
//! [`ComponentReconciler`] applies the objects of one component and prunes
//! what it no longer renders, and [`ControlPlaneReconciler`] drives every
//! component of a control plane and persists the status tree.

pub mod client;
pub mod component;
pub mod conditions;
pub mod control_plane;
pub mod finalizers;
pub mod hooks;
pub mod leader;
pub mod manifest;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod object;
pub mod patch;
mod reconciler;

#[cfg(test)]
mod component_test;
#[cfg(test)]
pub(crate) mod fake_client;

pub use client::{ClusterClient, KubeClusterClient};
pub use component::ComponentReconciler;
pub use control_plane::{
    ComponentOrder, ControlPlaneReconciler, EngineConfig, ReadinessConfig, ReconcileOutcome,
    DEFAULT_COMPONENT_ORDER,
};
pub use finalizers::CONTROL_PLANE_FINALIZER;
pub use hooks::{HookRegistry, ObjectHook, SccGrants, SecurityContextGrants};
pub use leader::{holder_identity, run_leader_election, wait_for_leadership};
pub use manifest::{DirectoryRenderer, Manifest, ManifestRenderer, RenderedManifests};
pub use object::{ObjectReconciler, ReconcileContext};
pub use patch::{ObjectPatch, PatchFactory, ThreeWayMergePatchFactory};
pub use reconciler::{run_controller, ControllerState};
