//! Custom Resource Definitions for the mesh operator
//!
//! This module defines the ServiceMeshControlPlane CRD and the status tree it
//! carries.

mod control_plane;
pub mod resource_key;
pub mod types;


pub use control_plane::{
    ServiceMeshControlPlane, ServiceMeshControlPlaneSpec, CONTROL_PLANE_GROUP,
    CONTROL_PLANE_KIND, CONTROL_PLANE_VERSION,
};
pub use resource_key::{split_api_version, GroupKind, ResourceKey};
pub use types::*;
