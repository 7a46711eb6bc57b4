//! mesh-operator: Kubernetes operator for a multi-component service mesh
//! control plane
//!
//! A ServiceMeshControlPlane resource selects a set of rendered charts. The
//! operator applies every object of every chart with three-way merge patches,
//! prunes what is no longer rendered and records the outcome in a per-component,
//! per-object status tree.

pub mod controller;
pub mod crd;
pub mod error;
pub mod retry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
