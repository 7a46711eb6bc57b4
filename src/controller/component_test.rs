//! Tests for the component reconciler

#[cfg(test)]
mod tests {
    use super::super::component::*;
    use super::super::fake_client::{control_plane, FakeClusterClient, Verb};
    use super::super::hooks::{HookRegistry, SecurityContextGrants};
    use super::super::manifest::Manifest;
    use super::super::object::{ObjectReconciler, ReconcileContext};
    use super::super::patch::ThreeWayMergePatchFactory;
    use crate::crd::{ConditionReason, ConditionType, ResourceKey};
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingGrants {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SecurityContextGrants for RecordingGrants {
        async fn grant(&self, namespace: &str, service_account: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("grant {}/{}", namespace, service_account));
            Ok(())
        }

        async fn revoke(&self, namespace: &str, service_account: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("revoke {}/{}", namespace, service_account));
            Ok(())
        }
    }

    fn reconciler(client: &Arc<FakeClusterClient>, hooks: HookRegistry) -> ComponentReconciler {
        ComponentReconciler::new(ObjectReconciler::new(
            client.clone(),
            Arc::new(ThreeWayMergePatchFactory),
            Arc::new(hooks),
        ))
    }

    const PILOT: &str = "\
apiVersion: v1
kind: ServiceAccount
metadata:
  name: istio-pilot
  namespace: istio-system
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: pilot-envoy-config
  namespace: istio-system
data:
  envoy.yaml: \"{}\"
";

    #[tokio::test]
    async fn test_same_input_twice_changes_nothing() {
        let client = Arc::new(FakeClusterClient::new());
        let components = reconciler(&client, HookRegistry::new());
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");
        let manifests = vec![Manifest::new("pilot.yaml", PILOT)];

        let (first, result) = components
            .reconcile_component(&ctx, "istio/charts/pilot", &manifests, None)
            .await;
        assert!(result.is_ok());
        assert_eq!(first.resources.len(), 2);
        assert!(first.status.is_installed());
        client.clear_ops();

        let (second, result) = components
            .reconcile_component(&ctx, "istio/charts/pilot", &manifests, Some(&first))
            .await;
        assert!(result.is_ok());
        assert_eq!(client.mutations(), 0);
        assert_eq!(second.resources.len(), 2);
        assert_eq!(
            second.status.get_condition(ConditionType::Reconciled).reason,
            Some(ConditionReason::ReconcileSuccessful)
        );
    }

    #[tokio::test]
    async fn test_only_yaml_files_are_applied() {
        let client = Arc::new(FakeClusterClient::new());
        let components = reconciler(&client, HookRegistry::new());
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");
        let manifests = vec![
            Manifest::new("NOTES.txt", "kind: [not even yaml"),
            Manifest::new("pilot.yaml", PILOT),
        ];

        let (status, result) = components
            .reconcile_component(&ctx, "istio/charts/pilot", &manifests, None)
            .await;
        assert!(result.is_ok());
        assert_eq!(status.resources.len(), 2);
    }

    #[tokio::test]
    async fn test_decode_error_does_not_stop_siblings() {
        let client = Arc::new(FakeClusterClient::new());
        let components = reconciler(&client, HookRegistry::new());
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");
        let manifests = vec![
            Manifest::new("broken.yaml", "metadata: [unclosed\n"),
            Manifest::new("pilot.yaml", PILOT),
        ];

        let (status, result) = components
            .reconcile_component(&ctx, "istio/charts/pilot", &manifests, None)
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("broken.yaml"));
        assert_eq!(client.ops_with(Verb::Create).len(), 2);
        assert_eq!(status.resources.len(), 2);
        assert!(status.resources.iter().all(|r| r.status.is_installed()));
        assert_eq!(
            status.status.get_condition(ConditionType::Installed).reason,
            Some(ConditionReason::InstallError)
        );
    }

    #[tokio::test]
    async fn test_service_account_lifecycle_runs_grants() {
        let client = Arc::new(FakeClusterClient::new());
        let grants = Arc::new(RecordingGrants::default());
        let components = reconciler(&client, HookRegistry::with_builtin_hooks(Some(grants.clone())));
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");

        let (installed, result) = components
            .reconcile_component(&ctx, "A", &[Manifest::new("pilot.yaml", PILOT)], None)
            .await;
        assert!(result.is_ok());

        let (removed, result) = components
            .reconcile_component(&ctx, "A", &[], Some(&installed))
            .await;
        assert!(result.is_ok());

        let sa = ResourceKey::new("", "v1", "ServiceAccount", "istio-system", "istio-pilot");
        assert!(!client.contains(&sa));
        assert_eq!(
            *grants.calls.lock().unwrap(),
            vec![
                "grant istio-system/istio-pilot".to_string(),
                "revoke istio-system/istio-pilot".to_string()
            ]
        );

        // deletion walks objects newest first but keeps their recorded order
        let kinds: Vec<_> = removed
            .resources
            .iter()
            .map(|r| r.resource.kind.as_str())
            .collect();
        assert_eq!(kinds, vec!["ServiceAccount", "ConfigMap"]);
        let deleted: Vec<_> = client
            .ops_with(Verb::Delete)
            .into_iter()
            .map(|op| op.key.kind)
            .collect();
        assert_eq!(deleted, vec!["ConfigMap", "ServiceAccount"]);

        let installed_condition = removed.status.get_condition(ConditionType::Installed);
        assert_eq!(
            installed_condition.reason,
            Some(ConditionReason::DeletionSuccessful)
        );
        assert!(removed.status.is_reconciled());
    }

    #[tokio::test]
    async fn test_confirmed_deletions_are_dropped() {
        let client = Arc::new(FakeClusterClient::new());
        let components = reconciler(&client, HookRegistry::new());
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");

        let (installed, _) = components
            .reconcile_component(&ctx, "A", &[Manifest::new("pilot.yaml", PILOT)], None)
            .await;
        let (removed, _) = components
            .reconcile_component(&ctx, "A", &[], Some(&installed))
            .await;
        client.clear_ops();

        let (pruned, result) = components
            .reconcile_component(&ctx, "A", &[], Some(&removed))
            .await;
        assert!(result.is_ok());
        assert!(pruned.resources.is_empty());
        assert!(client.ops().is_empty());
    }

    #[tokio::test]
    async fn test_only_non_yaml_manifests_tear_down() {
        let client = Arc::new(FakeClusterClient::new());
        let components = reconciler(&client, HookRegistry::new());
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");

        let (installed, _) = components
            .reconcile_component(&ctx, "A", &[Manifest::new("pilot.yaml", PILOT)], None)
            .await;
        let notes = [Manifest::new("NOTES.txt", "Pilot is disabled.\n")];
        let (removed, result) = components
            .reconcile_component(&ctx, "A", &notes, Some(&installed))
            .await;

        assert!(result.is_ok());
        assert_eq!(client.ops_with(Verb::Delete).len(), 2);
        let condition = removed.status.get_condition(ConditionType::Installed);
        assert_eq!(condition.reason, Some(ConditionReason::DeletionSuccessful));
        assert!(!removed.status.is_installed());
    }

    #[tokio::test]
    async fn test_unknown_component_with_no_manifests() {
        let client = Arc::new(FakeClusterClient::new());
        let components = reconciler(&client, HookRegistry::new());
        let smcp = control_plane("basic", "istio-system");
        let ctx = ReconcileContext::new(&smcp, "1.0.0");

        let (status, result) = components.reconcile_component(&ctx, "A", &[], None).await;
        assert!(result.is_ok());
        assert_eq!(status.resource, "A");
        assert!(status.resources.is_empty());
        assert!(!status.status.is_installed());
        assert!(client.ops().is_empty());
    }
}
