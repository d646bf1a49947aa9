//! In-memory [`Cluster`] for reconciler tests.
//!
//! Stores objects as JSON keyed by (kind, namespace, name) and simulates the
//! API server's create/update/delete status codes, so the generic sync driver
//! can be exercised without any infrastructure.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::{Resource, ResourceExt};

use super::{Cluster, SyncedObject};
use crate::error::{Error, Result};

type Key = (String, String, String);

#[derive(Clone, Default)]
pub struct FakeCluster {
    objects: Arc<Mutex<BTreeMap<Key, serde_json::Value>>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object into the store, bypassing create semantics
    pub fn insert<K: SyncedObject>(&self, obj: &K) {
        let key = Self::key_of(obj).expect("seeded object needs namespace and name");
        let value = serde_json::to_value(obj).expect("serializable object");
        self.objects.lock().unwrap().insert(key, value);
    }

    /// All stored objects of one kind, in name order
    pub fn stored<K: SyncedObject>(&self) -> Vec<K> {
        let kind = K::kind_str();
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("stored object deserializes"))
            .collect()
    }

    fn key_of<K: SyncedObject>(obj: &K) -> Result<Key> {
        let namespace = obj
            .namespace()
            .ok_or_else(|| Error::validation("object has no namespace"))?;
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::validation("object has no name"))?;
        Ok((K::kind_str(), namespace, name))
    }

    fn not_found<K: SyncedObject>(namespace: &str, name: &str) -> Error {
        Error::NotFound {
            kind: K::kind_str(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn get<K: SyncedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let key = (K::kind_str(), namespace.to_string(), name.to_string());
        let objects = self.objects.lock().unwrap();
        match objects.get(&key) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone()).map_err(|e| {
                Error::internal(format!("stored object does not deserialize: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    async fn list<K: SyncedObject>(&self, namespace: Option<&str>) -> Result<Vec<K>> {
        let kind = K::kind_str();
        let objects = self.objects.lock().unwrap();
        objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && namespace.is_none_or(|want| ns.as_str() == want))
            .map(|(_, v)| {
                serde_json::from_value(v.clone())
                    .map_err(|e| Error::internal(format!("stored object does not deserialize: {e}")))
            })
            .collect()
    }

    async fn create<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: key.0,
                namespace: key.1,
                name: key.2,
            });
        }
        objects.insert(key, serde_json::to_value(obj).unwrap());
        Ok(obj.clone())
    }

    async fn update<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        if !objects.contains_key(&key) {
            return Err(Self::not_found::<K>(&key.1, &key.2));
        }
        objects.insert(key, serde_json::to_value(obj).unwrap());
        Ok(obj.clone())
    }

    async fn update_status<K: SyncedObject>(&self, obj: &K) -> Result<K> {
        let key = Self::key_of(obj)?;
        let mut objects = self.objects.lock().unwrap();
        let Some(stored) = objects.get_mut(&key) else {
            return Err(Self::not_found::<K>(&key.1, &key.2));
        };
        let new = serde_json::to_value(obj).unwrap();
        if let (Some(map), Some(new_map)) = (stored.as_object_mut(), new.as_object()) {
            match new_map.get("status") {
                Some(status) => {
                    map.insert("status".to_string(), status.clone());
                }
                None => {
                    map.remove("status");
                }
            }
        }
        serde_json::from_value(stored.clone())
            .map_err(|e| Error::internal(format!("stored object does not deserialize: {e}")))
    }

    async fn delete<K: SyncedObject>(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (K::kind_str(), namespace.to_string(), name.to_string());
        let mut objects = self.objects.lock().unwrap();
        if objects.remove(&key).is_none() {
            return Err(Self::not_found::<K>(namespace, name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn secret(ns: &str, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let cluster = FakeCluster::new();
        cluster.create(&secret("test", "a")).await.unwrap();

        let got: Option<Secret> = cluster.get("test", "a").await.unwrap();
        assert!(got.is_some());

        cluster.delete::<Secret>("test", "a").await.unwrap();
        let got: Option<Secret> = cluster.get("test", "a").await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let cluster = FakeCluster::new();
        cluster.create(&secret("test", "a")).await.unwrap();
        let err = cluster.create(&secret("test", "a")).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let cluster = FakeCluster::new();
        let err = cluster.update(&secret("test", "a")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_namespace() {
        let cluster = FakeCluster::new();
        cluster.insert(&secret("a", "one"));
        cluster.insert(&secret("b", "two"));

        let all: Vec<Secret> = cluster.list(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let scoped: Vec<Secret> = cluster.list(Some("a")).await.unwrap();
        assert_eq!(scoped.len(), 1);
    }
}
