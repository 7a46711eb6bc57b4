//! Per-kind extension hooks run around object create/patch/delete
//!
//! Hooks are keyed by [`GroupKind`] in a [`HookRegistry`] built once at
//! startup. Only a `pre_apply` failure affects the object being reconciled;
//! `post_create` and `post_delete` failures are logged.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, info, warn};

use super::client::ClusterClient;
use crate::crd::{GroupKind, ResourceKey, ServiceMeshControlPlane};
use crate::error::{Error, Result};
use crate::retry::{retry_on_conflict, RetryConfig};

/// What a hook may see during a pass
pub struct HookContext<'a> {
    pub client: &'a dyn ClusterClient,
    pub instance: &'a ServiceMeshControlPlane,
}

impl HookContext<'_> {
    pub fn namespace(&self) -> String {
        self.instance.namespace().unwrap_or_default()
    }
}

#[async_trait]
pub trait ObjectHook: Send + Sync {
    /// Mutate the desired object before it is sent to the cluster
    async fn pre_apply(&self, _ctx: &HookContext<'_>, _obj: &mut DynamicObject) -> Result<()> {
        Ok(())
    }

    async fn post_create(&self, _ctx: &HookContext<'_>, _obj: &DynamicObject) -> Result<()> {
        Ok(())
    }

    async fn post_delete(&self, _ctx: &HookContext<'_>, _key: &ResourceKey) -> Result<()> {
        Ok(())
    }
}

/// Hooks by the kind they apply to
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<GroupKind, Vec<Arc<dyn ObjectHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the hooks every installation needs; the ServiceAccount
    /// hook is only added when security grants are configured
    pub fn with_builtin_hooks(grants: Option<Arc<dyn SecurityContextGrants>>) -> Self {
        let mut registry = Self::new();
        registry.register(GroupKind::new("", "ConfigMap"), Arc::new(KialiConfigHook));
        if let Some(grants) = grants {
            registry.register(
                GroupKind::new("", "ServiceAccount"),
                Arc::new(ServiceAccountHook::new(grants)),
            );
        }
        registry
    }

    pub fn register(&mut self, group_kind: GroupKind, hook: Arc<dyn ObjectHook>) -> &mut Self {
        self.hooks.entry(group_kind).or_default().push(hook);
        self
    }

    pub fn hooks_for(&self, group_kind: &GroupKind) -> &[Arc<dyn ObjectHook>] {
        self.hooks
            .get(group_kind)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Run every pre-apply hook for the object's kind, stopping at the first failure
    pub async fn pre_apply(
        &self,
        ctx: &HookContext<'_>,
        key: &ResourceKey,
        obj: &mut DynamicObject,
    ) -> Result<()> {
        for hook in self.hooks_for(&key.group_kind()) {
            hook.pre_apply(ctx, obj).await?;
        }
        Ok(())
    }

    pub async fn post_create(&self, ctx: &HookContext<'_>, key: &ResourceKey, obj: &DynamicObject) {
        for hook in self.hooks_for(&key.group_kind()) {
            if let Err(e) = hook.post_create(ctx, obj).await {
                warn!(resource = %key, error = %e, "Post-create hook failed");
            }
        }
    }

    pub async fn post_delete(&self, ctx: &HookContext<'_>, key: &ResourceKey) {
        for hook in self.hooks_for(&key.group_kind()) {
            if let Err(e) = hook.post_delete(ctx, key).await {
                warn!(resource = %key, error = %e, "Post-delete hook failed");
            }
        }
    }
}

const KIALI_CONFIG_MAP: &str = "kiali";
const KIALI_CONFIG_KEY: &str = "config.yaml";

/// Points the kiali console at the Grafana and tracing routes of the mesh
pub struct KialiConfigHook;

impl KialiConfigHook {
    async fn route_url(ctx: &HookContext<'_>, name: &str) -> Result<Option<String>> {
        let key = ResourceKey::new("route.openshift.io", "v1", "Route", ctx.namespace(), name);
        let route = match ctx.client.get(&key).await {
            Ok(route) => route,
            Err(e) if e.is_not_found() => {
                debug!("Route {} not found, leaving kiali default", key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(host) = route.data["spec"]["host"].as_str().filter(|h| !h.is_empty()) else {
            return Ok(None);
        };
        let scheme = if route.data["spec"]["tls"].is_object() {
            "https"
        } else {
            "http"
        };
        Ok(Some(format!("{}://{}", scheme, host)))
    }
}

#[async_trait]
impl ObjectHook for KialiConfigHook {
    async fn pre_apply(&self, ctx: &HookContext<'_>, obj: &mut DynamicObject) -> Result<()> {
        if obj.metadata.name.as_deref() != Some(KIALI_CONFIG_MAP) {
            return Ok(());
        }

        let grafana = Self::route_url(ctx, "grafana").await?;
        let tracing = Self::route_url(ctx, "tracing").await?;
        if grafana.is_none() && tracing.is_none() {
            return Ok(());
        }

        let raw = obj.data["data"][KIALI_CONFIG_KEY].as_str().unwrap_or_default();
        let mut config: YamlValue = if raw.trim().is_empty() {
            YamlValue::Mapping(Mapping::new())
        } else {
            serde_yaml::from_str(raw)?
        };

        for (service, url) in [("grafana", grafana), ("tracing", tracing)] {
            if let Some(url) = url {
                set_yaml_path(&mut config, &["external_services", service, "url"], url)?;
            }
        }

        let rendered = serde_yaml::to_string(&config)?;
        if !obj.data["data"].is_object() {
            obj.data["data"] = Value::Object(Default::default());
        }
        obj.data["data"][KIALI_CONFIG_KEY] = Value::String(rendered);
        Ok(())
    }
}

fn set_yaml_path(root: &mut YamlValue, path: &[&str], value: String) -> Result<()> {
    let mut node = root;
    for (i, segment) in path.iter().enumerate() {
        if node.is_null() {
            *node = YamlValue::Mapping(Mapping::new());
        }
        let map = node.as_mapping_mut().ok_or_else(|| {
            Error::HookError(format!(
                "kiali {} has a non-map value at {}",
                KIALI_CONFIG_KEY,
                path[..i].join(".")
            ))
        })?;
        let key = YamlValue::String((*segment).to_string());
        if i + 1 == path.len() {
            map.insert(key, YamlValue::String(value));
            return Ok(());
        }
        node = map.entry(key).or_insert(YamlValue::Null);
    }
    Ok(())
}

/// Grants and revokes a security capability for a ServiceAccount
#[async_trait]
pub trait SecurityContextGrants: Send + Sync {
    async fn grant(&self, namespace: &str, service_account: &str) -> Result<()>;
    async fn revoke(&self, namespace: &str, service_account: &str) -> Result<()>;
}

/// Keeps ServiceAccounts created by the engine in the configured grants
pub struct ServiceAccountHook {
    grants: Arc<dyn SecurityContextGrants>,
}

impl ServiceAccountHook {
    pub fn new(grants: Arc<dyn SecurityContextGrants>) -> Self {
        Self { grants }
    }
}

#[async_trait]
impl ObjectHook for ServiceAccountHook {
    async fn post_create(&self, _ctx: &HookContext<'_>, obj: &DynamicObject) -> Result<()> {
        let namespace = obj.namespace().unwrap_or_default();
        self.grants.grant(&namespace, &obj.name_any()).await
    }

    async fn post_delete(&self, _ctx: &HookContext<'_>, key: &ResourceKey) -> Result<()> {
        self.grants.revoke(&key.namespace, &key.name).await
    }
}

/// [`SecurityContextGrants`] over OpenShift SecurityContextConstraints
pub struct SccGrants {
    client: Arc<dyn ClusterClient>,
    constraints: Vec<String>,
    retry: RetryConfig,
}

impl SccGrants {
    pub fn new(client: Arc<dyn ClusterClient>, constraints: Vec<String>) -> Self {
        Self {
            client,
            constraints,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn user_name(namespace: &str, service_account: &str) -> String {
        format!("system:serviceaccount:{}:{}", namespace, service_account)
    }

    fn constraint_key(name: &str) -> ResourceKey {
        ResourceKey::new(
            "security.openshift.io",
            "v1",
            "SecurityContextConstraints",
            "",
            name,
        )
    }

    async fn update_users(&self, user: &str, add: bool) -> Result<()> {
        let client = self.client.as_ref();
        for constraint in &self.constraints {
            let key = Self::constraint_key(constraint);
            let key = &key;
            retry_on_conflict(&self.retry, &format!("update {}", key), || async move {
                let mut scc = client.get(key).await?;
                let mut users: Vec<String> = match scc.data.get("users") {
                    Some(Value::Array(list)) => list
                        .iter()
                        .filter_map(|u| u.as_str().map(str::to_string))
                        .collect(),
                    _ => Vec::new(),
                };
                let present = users.iter().any(|u| u == user);
                if present == add {
                    return Ok(());
                }
                if add {
                    users.push(user.to_string());
                } else {
                    users.retain(|u| u != user);
                }
                scc.data["users"] = serde_json::to_value(&users)?;
                client.update(&scc).await?;
                info!(
                    "{} {} in SecurityContextConstraints {}",
                    if add { "Granted" } else { "Revoked" },
                    user,
                    constraint
                );
                Ok(())
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SecurityContextGrants for SccGrants {
    async fn grant(&self, namespace: &str, service_account: &str) -> Result<()> {
        self.update_users(&Self::user_name(namespace, service_account), true)
            .await
    }

    async fn revoke(&self, namespace: &str, service_account: &str) -> Result<()> {
        self.update_users(&Self::user_name(namespace, service_account), false)
            .await
    }
}
