//! Status tree types shared by the control plane, its components and the
//! objects they own

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::resource_key::ResourceKey;

/// Kind of condition tracked for every level of the status tree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    /// The resource has been created (or deleted, when False after a teardown)
    Installed,
    /// The last pass brought the resource in line with its desired state
    Reconciled,
}

/// Status of a condition: "True", "False", or "Unknown"
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Machine-readable reason for a condition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionReason {
    InstallSuccessful,
    InstallError,
    ReconcileSuccessful,
    ReconcileError,
    DeletionSuccessful,
    DeletionError,
}

/// A typed condition following Kubernetes API conventions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// RFC3339 time of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// The zero value reported for a condition that was never set
    pub fn unknown(type_: ConditionType) -> Self {
        Self {
            type_,
            status: ConditionStatus::Unknown,
            reason: None,
            message: String::new(),
            last_transition_time: None,
        }
    }

    pub fn new(
        type_: ConditionType,
        status: ConditionStatus,
        reason: ConditionReason,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: Some(reason),
            message: message.into(),
            last_transition_time: None,
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Conditions plus the generation they were computed for
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusType {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl StatusType {
    /// Condition of the given type, or an Unknown zero value when absent
    pub fn get_condition(&self, type_: ConditionType) -> Condition {
        self.conditions
            .iter()
            .find(|c| c.type_ == type_)
            .cloned()
            .unwrap_or_else(|| Condition::unknown(type_))
    }

    /// Store a condition, replacing any prior one of the same type
    ///
    /// The transition time is refreshed only when the status changes.
    pub fn set_condition(&mut self, mut condition: Condition) {
        let now = Utc::now().to_rfc3339();
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            condition.last_transition_time = if existing.status != condition.status {
                Some(now)
            } else {
                existing.last_transition_time.clone().or(Some(now))
            };
            *existing = condition;
        } else {
            condition.last_transition_time = Some(now);
            self.conditions.push(condition);
        }
    }

    pub fn remove_condition(&mut self, type_: ConditionType) {
        self.conditions.retain(|c| c.type_ != type_);
    }

    pub fn is_installed(&self) -> bool {
        self.get_condition(ConditionType::Installed).is_true()
    }

    pub fn is_reconciled(&self) -> bool {
        self.get_condition(ConditionType::Reconciled).is_true()
    }
}

/// Status of a single object created for a component
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub resource: ResourceKey,
    #[serde(flatten)]
    pub status: StatusType,
}

impl ResourceStatus {
    pub fn new(resource: ResourceKey) -> Self {
        Self {
            resource,
            status: StatusType::default(),
        }
    }
}

/// Status of one rendered component (a chart or sub-chart)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    /// Component name
    pub resource: String,
    #[serde(flatten)]
    pub status: StatusType,
    /// Objects of this component, in creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

impl ComponentStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            resource: name.into(),
            ..Default::default()
        }
    }

    pub fn find_resource(&self, key: &ResourceKey) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| &r.resource == key)
    }
}

/// Top-level status of a ServiceMeshControlPlane
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    #[serde(flatten)]
    pub status: StatusType,
    /// Components in installation order; always serialized so that a merge
    /// patch can clear it
    #[serde(default)]
    pub component_status: Vec<ComponentStatus>,
}

impl ControlPlaneStatus {
    pub fn find_component(&self, name: &str) -> Option<&ComponentStatus> {
        self.component_status.iter().find(|c| c.resource == name)
    }
}
