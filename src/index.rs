//! Secondary indexes over the virtual object graph and the physical→virtual
//! reverse map.
//!
//! The dependency graph (pods → secrets/configmaps/serviceaccounts,
//! ingresses → secrets) is represented as an index rebuilt from watch events,
//! not chased at event time. Index keys are `"<namespace>/<name>"`.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;

use crate::translate::refs::{
    config_maps_referenced_by_pod, secrets_referenced_by_ingress, secrets_referenced_by_pod,
    service_account_referenced_by_pod, ResourceRef,
};

#[derive(Default)]
struct Index {
    // index key -> referencing objects
    forward: HashMap<String, BTreeSet<ResourceRef>>,
    // referencing object -> its index keys, for cheap removal on update
    reverse: HashMap<ResourceRef, BTreeSet<String>>,
}

impl Index {
    fn set(&mut self, referrer: ResourceRef, keys: BTreeSet<String>) {
        self.remove(&referrer);
        for key in &keys {
            self.forward
                .entry(key.clone())
                .or_default()
                .insert(referrer.clone());
        }
        if !keys.is_empty() {
            self.reverse.insert(referrer, keys);
        }
    }

    fn remove(&mut self, referrer: &ResourceRef) {
        if let Some(keys) = self.reverse.remove(referrer) {
            for key in keys {
                if let Some(set) = self.forward.get_mut(&key) {
                    set.remove(referrer);
                    if set.is_empty() {
                        self.forward.remove(&key);
                    }
                }
            }
        }
    }

    fn lookup(&self, key: &str) -> Vec<ResourceRef> {
        self.forward
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// The four secondary indexes of the virtual cluster
#[derive(Default)]
pub struct RefIndex {
    pods_by_secret: RwLock<Index>,
    pods_by_config_map: RwLock<Index>,
    pods_by_service_account: RwLock<Index>,
    ingresses_by_secret: RwLock<Index>,
}

impl RefIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record (or re-record) a virtual pod's references
    pub fn observe_pod(&self, pod: &Pod) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };
        let pod_ref = ResourceRef::new(pod.namespace().unwrap_or_default(), name);

        let secrets = secrets_referenced_by_pod(pod)
            .into_iter()
            .map(|r| r.key())
            .collect();
        self.pods_by_secret
            .write()
            .unwrap()
            .set(pod_ref.clone(), secrets);

        let config_maps = config_maps_referenced_by_pod(pod)
            .into_iter()
            .map(|r| r.key())
            .collect();
        self.pods_by_config_map
            .write()
            .unwrap()
            .set(pod_ref.clone(), config_maps);

        let service_accounts = service_account_referenced_by_pod(pod)
            .into_iter()
            .map(|r| r.key())
            .collect();
        self.pods_by_service_account
            .write()
            .unwrap()
            .set(pod_ref, service_accounts);
    }

    /// Drop a deleted virtual pod from all indexes
    pub fn forget_pod(&self, pod_ref: &ResourceRef) {
        self.pods_by_secret.write().unwrap().remove(pod_ref);
        self.pods_by_config_map.write().unwrap().remove(pod_ref);
        self.pods_by_service_account.write().unwrap().remove(pod_ref);
    }

    /// Record (or re-record) a virtual ingress's TLS secret references
    pub fn observe_ingress(&self, ingress: &Ingress) {
        let Some(name) = ingress.metadata.name.clone() else {
            return;
        };
        let ingress_ref = ResourceRef::new(ingress.namespace().unwrap_or_default(), name);
        let secrets = secrets_referenced_by_ingress(ingress)
            .into_iter()
            .map(|r| r.key())
            .collect();
        self.ingresses_by_secret
            .write()
            .unwrap()
            .set(ingress_ref, secrets);
    }

    /// Drop a deleted virtual ingress
    pub fn forget_ingress(&self, ingress_ref: &ResourceRef) {
        self.ingresses_by_secret.write().unwrap().remove(ingress_ref);
    }

    pub fn pods_by_secret(&self, key: &str) -> Vec<ResourceRef> {
        self.pods_by_secret.read().unwrap().lookup(key)
    }

    pub fn pods_by_config_map(&self, key: &str) -> Vec<ResourceRef> {
        self.pods_by_config_map.read().unwrap().lookup(key)
    }

    pub fn pods_by_service_account(&self, key: &str) -> Vec<ResourceRef> {
        self.pods_by_service_account.read().unwrap().lookup(key)
    }

    pub fn ingresses_by_secret(&self, key: &str) -> Vec<ResourceRef> {
        self.ingresses_by_secret.read().unwrap().lookup(key)
    }
}

/// Reverse map from physical object names to the virtual objects they were
/// projected from, per kind. Fed by physical watch events (the stamped
/// annotations carry the virtual identity); consulted by event mapping and
/// the metrics rewrite filter. The translation function is never parsed.
#[derive(Default)]
pub struct NameCache {
    by_kind: RwLock<HashMap<&'static str, HashMap<String, ResourceRef>>>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, kind: &'static str, physical_name: &str, virtual_ref: ResourceRef) {
        self.by_kind
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .insert(physical_name.to_string(), virtual_ref);
    }

    pub fn forget(&self, kind: &'static str, physical_name: &str) {
        if let Some(map) = self.by_kind.write().unwrap().get_mut(kind) {
            map.remove(physical_name);
        }
    }

    pub fn lookup(&self, kind: &'static str, physical_name: &str) -> Option<ResourceRef> {
        self.by_kind
            .read()
            .unwrap()
            .get(kind)?
            .get(physical_name)
            .cloned()
    }

    /// Snapshot of one kind's physical→virtual name pairs
    pub fn pairs(&self, kind: &'static str) -> Vec<(String, ResourceRef)> {
        self.by_kind
            .read()
            .unwrap()
            .get(kind)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, SecretVolumeSource, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_using_secret(ns: &str, pod: &str, secret: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(pod.into()),
                namespace: Some(ns.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "v".into(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret.into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                containers: vec![],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn observe_and_lookup_pod_by_secret() {
        let index = RefIndex::new();
        index.observe_pod(&pod_using_secret("test", "p1", "s1"));

        let pods = index.pods_by_secret("test/s1");
        assert_eq!(pods, vec![ResourceRef::new("test", "p1")]);
        assert!(index.pods_by_secret("test/other").is_empty());
    }

    #[test]
    fn reobserving_replaces_old_references() {
        let index = RefIndex::new();
        index.observe_pod(&pod_using_secret("test", "p1", "s1"));
        index.observe_pod(&pod_using_secret("test", "p1", "s2"));

        assert!(index.pods_by_secret("test/s1").is_empty());
        assert_eq!(
            index.pods_by_secret("test/s2"),
            vec![ResourceRef::new("test", "p1")]
        );
    }

    #[test]
    fn forget_pod_clears_all_indexes() {
        let index = RefIndex::new();
        index.observe_pod(&pod_using_secret("test", "p1", "s1"));
        index.forget_pod(&ResourceRef::new("test", "p1"));
        assert!(index.pods_by_secret("test/s1").is_empty());
    }

    #[test]
    fn name_cache_roundtrip() {
        let cache = NameCache::new();
        cache.record("Pod", "p1-x-test-x-s1", ResourceRef::new("test", "p1"));
        assert_eq!(
            cache.lookup("Pod", "p1-x-test-x-s1"),
            Some(ResourceRef::new("test", "p1"))
        );
        cache.forget("Pod", "p1-x-test-x-s1");
        assert_eq!(cache.lookup("Pod", "p1-x-test-x-s1"), None);
    }
}
