//! Typed access to the two API servers.
//!
//! The sync engine talks to both clusters through the [`Cluster`] trait so
//! reconcilers can be exercised against an in-memory store in tests, the same
//! way the proxy's dependencies are trait seams.

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Bounds shared by every kind the syncer projects
pub trait SyncedObject:
    kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + std::fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// The object kind, e.g. "Secret"
    fn kind_str() -> String {
        Self::kind(&()).into_owned()
    }
}

impl<K> SyncedObject for K where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + std::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespaced CRUD against one API server
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    async fn get<K: SyncedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn list<K: SyncedObject>(&self, namespace: Option<&str>) -> Result<Vec<K>>;

    async fn create<K: SyncedObject>(&self, obj: &K) -> Result<K>;

    async fn update<K: SyncedObject>(&self, obj: &K) -> Result<K>;

    /// Replace only the status subresource
    async fn update_status<K: SyncedObject>(&self, obj: &K) -> Result<K>;

    async fn delete<K: SyncedObject>(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Production [`Cluster`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    fn api<K: SyncedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn object_keys<K: SyncedObject>(obj: &K) -> Result<(String, String)> {
        let namespace = obj.namespace().ok_or_else(|| {
            Error::validation(format!("{} has no namespace", K::kind_str()))
        })?;
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::validation(format!("{} has no name", K::kind_str())))?;
        Ok((namespace, name))
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get<K: SyncedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: SyncedObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let list = match namespace {
            Some(ns) => self.api::<K>(ns).list(&ListParams::default()).await?,
            None => {
                Api::<K>::all(self.client.clone())
                    .list(&ListParams::default())
                    .await?
            }
        };
        Ok(list.items)
    }

    async fn create<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        let (namespace, _) = Self::object_keys(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = Self::object_keys(obj)?;
        Ok(self
            .api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn update_status<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = Self::object_keys(obj)?;
        let data = serde_json::to_vec(obj)
            .map_err(|e| Error::internal(format!("serialize {}: {e}", K::kind_str())))?;
        Ok(self
            .api::<K>(&namespace)
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }

    async fn delete<K: SyncedObject>(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
