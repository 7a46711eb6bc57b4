//! Condition transition rules shared by objects, components and the control plane
//!
//! | Previous Installed | Outcome | Installed                | Reconciled                 |
//! |--------------------|---------|--------------------------|----------------------------|
//! | not True           | success | True, InstallSuccessful  | True, InstallSuccessful    |
//! | True               | success | unchanged                | True, ReconcileSuccessful  |
//! | Unknown            | error   | False, InstallError      | False, InstallError        |
//! | True or False      | error   | unchanged                | False, ReconcileError      |

use crate::crd::{Condition, ConditionReason, ConditionStatus, ConditionType, StatusType};
use crate::error::Error;

/// Apply the install/reconcile rules for the outcome of a pass
pub fn update_reconcile_conditions(status: &mut StatusType, err: Option<&Error>) {
    let installed = status.get_condition(ConditionType::Installed).status;

    match err {
        None if installed != ConditionStatus::True => {
            status.set_condition(Condition::new(
                ConditionType::Installed,
                ConditionStatus::True,
                ConditionReason::InstallSuccessful,
                "",
            ));
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::True,
                ConditionReason::InstallSuccessful,
                "",
            ));
        }
        None => {
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::True,
                ConditionReason::ReconcileSuccessful,
                "",
            ));
        }
        Some(e) if installed == ConditionStatus::Unknown => {
            let message = e.to_string();
            status.set_condition(Condition::new(
                ConditionType::Installed,
                ConditionStatus::False,
                ConditionReason::InstallError,
                message.clone(),
            ));
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::False,
                ConditionReason::InstallError,
                message,
            ));
        }
        Some(e) => {
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::False,
                ConditionReason::ReconcileError,
                e.to_string(),
            ));
        }
    }
}

/// Apply the deletion rules; `err` must already exclude NotFound and Gone
pub fn update_delete_conditions(status: &mut StatusType, err: Option<&Error>) {
    match err {
        None => {
            status.set_condition(Condition::new(
                ConditionType::Installed,
                ConditionStatus::False,
                ConditionReason::DeletionSuccessful,
                "",
            ));
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::True,
                ConditionReason::DeletionSuccessful,
                "",
            ));
        }
        Some(e) => {
            status.set_condition(Condition::new(
                ConditionType::Reconciled,
                ConditionStatus::False,
                ConditionReason::DeletionError,
                e.to_string(),
            ));
        }
    }
}

/// Whether the object is not installed, either never created or deleted
pub fn is_deleted(status: &StatusType) -> bool {
    status.get_condition(ConditionType::Installed).status == ConditionStatus::False
}

/// Whether a deletion of the object was confirmed
///
/// Unlike [`is_deleted`], a failed install does not count: the object may
/// still exist in the cluster.
pub fn deletion_confirmed(status: &StatusType) -> bool {
    let installed = status.get_condition(ConditionType::Installed);
    installed.status == ConditionStatus::False
        && installed.reason == Some(ConditionReason::DeletionSuccessful)
}
