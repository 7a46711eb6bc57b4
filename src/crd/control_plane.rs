//! ServiceMeshControlPlane Custom Resource Definition
//!
//! A ServiceMeshControlPlane represents one installation of the mesh control
//! plane. Its status carries the full per-component, per-object status tree.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ControlPlaneStatus;

pub const CONTROL_PLANE_GROUP: &str = "maistra.io";
pub const CONTROL_PLANE_VERSION: &str = "v1";
pub const CONTROL_PLANE_KIND: &str = "ServiceMeshControlPlane";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "maistra.io",
    version = "v1",
    kind = "ServiceMeshControlPlane",
    namespaced,
    status = "ControlPlaneStatus",
    shortname = "smcp",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Installed","type":"string","jsonPath":".status.conditions[?(@.type=='Installed')].status"}"#,
    printcolumn = r#"{"name":"Reconciled","type":"string","jsonPath":".status.conditions[?(@.type=='Reconciled')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshControlPlaneSpec {
    /// Control plane version; selects the chart set handed to the renderer
    #[serde(default = "default_version")]
    pub version: String,

    /// Named template (profile) the values are layered on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Chart values passed through to the renderer untouched
    #[serde(default)]
    #[schemars(with = "serde_json::Value")]
    pub istio: serde_json::Value,
}

fn default_version() -> String {
    "v1.0".to_string()
}

impl ServiceMeshControlPlane {
    /// Status of the resource, or an empty tree when it was never reconciled
    pub fn status_or_default(&self) -> ControlPlaneStatus {
        self.status.clone().unwrap_or_default()
    }
}
