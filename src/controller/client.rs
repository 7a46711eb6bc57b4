//! Cluster access used by the reconciliation engine
//!
//! The engine never talks to `kube::Client` directly. It goes through the
//! [`ClusterClient`] trait over untyped [`DynamicObject`]s so that any kind the
//! renderer emits can be reconciled, and so tests can substitute an in-memory
//! cluster.

use std::collections::HashMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, ApiResource, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::debug;

use crate::crd::ResourceKey;
use crate::error::{Error, Result};

/// Verbs the engine needs against arbitrary group/version/kinds
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject>;

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object; fails with a conflict when its resourceVersion is stale
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch
    async fn patch(&self, key: &ResourceKey, patch: &serde_json::Value) -> Result<DynamicObject>;

    /// Apply a JSON merge patch to the status subresource
    async fn patch_status(
        &self,
        key: &ResourceKey,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject>;

    async fn delete(&self, key: &ResourceKey, params: &DeleteParams) -> Result<()>;
}

type GvkKey = (String, String, String);

/// [`ClusterClient`] backed by a live API server
///
/// Resolved `ApiResource`s are cached per instance so discovery runs once per
/// kind for the lifetime of the operator.
pub struct KubeClusterClient {
    client: Client,
    resources: RwLock<HashMap<GvkKey, (ApiResource, bool)>>,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let cache_key = (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone());
        if let Some(found) = self.resources.read().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let (resource, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(
            "Discovered {}/{} {} (namespaced: {})",
            gvk.group, gvk.version, gvk.kind, namespaced
        );
        self.resources
            .write()
            .await
            .insert(cache_key, (resource.clone(), namespaced));
        Ok((resource, namespaced))
    }

    async fn api_for(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Api<DynamicObject>> {
        let (resource, namespaced) = self.resolve(gvk).await?;
        if namespaced {
            if namespace.is_empty() {
                return Err(Error::ManifestError(format!(
                    "{} is namespaced but no namespace was given",
                    gvk.kind
                )));
            }
            Ok(Api::namespaced_with(self.client.clone(), namespace, &resource))
        } else {
            Ok(Api::all_with(self.client.clone(), &resource))
        }
    }

    async fn api_for_key(&self, key: &ResourceKey) -> Result<Api<DynamicObject>> {
        self.api_for(&key.gvk(), &key.namespace).await
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        let api = self.api_for_key(key).await?;
        Ok(api.get(&key.name).await?)
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let (resource, namespaced) = self.resolve(gvk).await?;
        let api: Api<DynamicObject> = match namespace {
            Some(ns) if namespaced => Api::namespaced_with(self.client.clone(), ns, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        };
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj)?;
        let api = self.api_for_key(&key).await?;
        Ok(api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj)?;
        let api = self.api_for_key(&key).await?;
        Ok(api.replace(&key.name, &PostParams::default(), obj).await?)
    }

    async fn patch(&self, key: &ResourceKey, patch: &serde_json::Value) -> Result<DynamicObject> {
        let api = self.api_for_key(key).await?;
        Ok(api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(
        &self,
        key: &ResourceKey,
        patch: &serde_json::Value,
    ) -> Result<DynamicObject> {
        let api = self.api_for_key(key).await?;
        Ok(api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn delete(&self, key: &ResourceKey, params: &DeleteParams) -> Result<()> {
        let api = self.api_for_key(key).await?;
        api.delete(&key.name, params).await?;
        Ok(())
    }
}
