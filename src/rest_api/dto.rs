//! Response bodies of the REST API

use kube::ResourceExt;
use serde::Serialize;

use crate::controller::conditions::deletion_confirmed;
use crate::crd::{ComponentStatus, Condition, ServiceMeshControlPlane};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSummary {
    pub name: String,
    pub namespace: String,
    pub version: String,
    pub generation: i64,
    pub observed_generation: i64,
    pub installed: bool,
    pub reconciled: bool,
}

#[derive(Debug, Serialize)]
pub struct ControlPlaneListResponse {
    pub items: Vec<ControlPlaneSummary>,
    pub total: usize,
}

/// One component and how many of its objects are live
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    pub name: String,
    pub installed: bool,
    pub reconciled: bool,
    pub resources: usize,
    pub deleted_resources: usize,
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneDetailResponse {
    #[serde(flatten)]
    pub summary: ControlPlaneSummary,
    pub conditions: Vec<Condition>,
    pub components: Vec<ComponentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&ServiceMeshControlPlane> for ControlPlaneSummary {
    fn from(smcp: &ServiceMeshControlPlane) -> Self {
        let status = smcp.status_or_default().status;
        Self {
            name: smcp.name_any(),
            namespace: smcp.namespace().unwrap_or_default(),
            version: smcp.spec.version.clone(),
            generation: smcp.metadata.generation.unwrap_or_default(),
            observed_generation: status.observed_generation,
            installed: status.is_installed(),
            reconciled: status.is_reconciled(),
        }
    }
}

impl From<&ComponentStatus> for ComponentSummary {
    fn from(component: &ComponentStatus) -> Self {
        let deleted = component
            .resources
            .iter()
            .filter(|r| deletion_confirmed(&r.status))
            .count();
        Self {
            name: component.resource.clone(),
            installed: component.status.is_installed(),
            reconciled: component.status.is_reconciled(),
            resources: component.resources.len() - deleted,
            deleted_resources: deleted,
            conditions: component.status.conditions.clone(),
        }
    }
}

impl From<&ServiceMeshControlPlane> for ControlPlaneDetailResponse {
    fn from(smcp: &ServiceMeshControlPlane) -> Self {
        let status = smcp.status_or_default();
        Self {
            summary: ControlPlaneSummary::from(smcp),
            conditions: status.status.conditions.clone(),
            components: status
                .component_status
                .iter()
                .map(ComponentSummary::from)
                .collect(),
            created_at: smcp
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339()),
        }
    }
}
