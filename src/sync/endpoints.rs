//! Endpoints syncer.
//!
//! Endpoints are generated by the host's endpoints controller against the
//! physical service; the syncer only copies them back onto the virtual
//! endpoints object. Addresses stay untranslated: they are pod IPs, not
//! names, and the pod IPs are real either way.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};

use super::{SyncDirection, Syncer};
use crate::client::Cluster;
use crate::error::Result;
use crate::translate::refs::ResourceRef;

pub struct EndpointsSyncer<V> {
    virtual_cluster: Arc<V>,
}

impl<V: Cluster> EndpointsSyncer<V> {
    pub fn new(virtual_cluster: Arc<V>) -> Self {
        Self { virtual_cluster }
    }
}

#[async_trait]
impl<V: Cluster> Syncer for EndpointsSyncer<V> {
    type Object = Endpoints;

    fn kind_name(&self) -> &'static str {
        "endpoints"
    }

    fn direction(&self) -> SyncDirection {
        SyncDirection::Backward
    }

    async fn forward_create_needed(&self, _v: &Endpoints) -> Result<bool> {
        Ok(false)
    }

    async fn forward_update_needed(&self, _p: &Endpoints, _v: &Endpoints) -> Result<bool> {
        Ok(false)
    }

    async fn forward_create(&self, v: &Endpoints) -> Result<Endpoints> {
        Ok(v.clone())
    }

    async fn forward_update(&self, _p: &Endpoints, v: &Endpoints) -> Result<Endpoints> {
        Ok(v.clone())
    }

    async fn forward_delete(&self, _p: &Endpoints) -> Result<()> {
        Ok(())
    }

    async fn backward_update_needed(&self, p: &Endpoints, v: &Endpoints) -> Result<bool> {
        Ok(p.subsets != v.subsets)
    }

    async fn backward_update(&self, p: &Endpoints, v: &Endpoints) -> Result<()> {
        let mut updated = v.clone();
        updated.subsets = p.subsets.clone();
        self.virtual_cluster.update(&updated).await?;
        Ok(())
    }

    async fn backward_create(
        &self,
        key: &ResourceRef,
        p: &Endpoints,
    ) -> Result<Option<Endpoints>> {
        // Only mirror endpoints whose virtual service still exists; anything
        // else is a leftover the host will garbage-collect with the service.
        let service: Option<Service> = self
            .virtual_cluster
            .get(&key.namespace, &key.name)
            .await?;
        if service.is_none() {
            return Ok(None);
        }

        let endpoints = Endpoints {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(key.name.clone()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            subsets: p.subsets.clone(),
        };
        Ok(Some(self.virtual_cluster.create(&endpoints).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::sync::events::NoopEventSink;
    use crate::sync::generic::SyncController;
    use crate::translate::Translator;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn translator() -> Translator {
        Translator::new("host", "s1")
    }

    fn physical_endpoints(addresses: &[&str]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(translator().physical_name("web", "test")),
                namespace: Some("host".into()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|ip| EndpointAddress {
                            ip: ip.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }]),
        }
    }

    fn virtual_service() -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn controller(
        virtual_cluster: &FakeCluster,
        physical_cluster: &FakeCluster,
    ) -> SyncController<EndpointsSyncer<FakeCluster>, FakeCluster, FakeCluster> {
        SyncController::new(
            Arc::new(EndpointsSyncer::new(Arc::new(virtual_cluster.clone()))),
            Arc::new(virtual_cluster.clone()),
            Arc::new(physical_cluster.clone()),
            translator(),
            Arc::new(NoopEventSink),
        )
    }

    #[tokio::test]
    async fn physical_subsets_flow_onto_existing_virtual_endpoints() {
        let virtual_cluster = FakeCluster::new();
        let physical_cluster = FakeCluster::new();

        virtual_cluster.insert(&virtual_service());
        virtual_cluster.insert(&Endpoints {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            subsets: None,
        });
        physical_cluster.insert(&physical_endpoints(&["10.0.0.7"]));

        controller(&virtual_cluster, &physical_cluster)
            .reconcile(&ResourceRef::new("test", "web"))
            .await
            .unwrap();

        let stored = virtual_cluster.stored::<Endpoints>();
        let subsets = stored[0].subsets.as_ref().unwrap();
        assert_eq!(
            subsets[0].addresses.as_ref().unwrap()[0].ip,
            "10.0.0.7"
        );
    }

    #[tokio::test]
    async fn missing_virtual_endpoints_are_created_when_service_exists() {
        let virtual_cluster = FakeCluster::new();
        let physical_cluster = FakeCluster::new();

        virtual_cluster.insert(&virtual_service());
        physical_cluster.insert(&physical_endpoints(&["10.0.0.8"]));

        controller(&virtual_cluster, &physical_cluster)
            .reconcile(&ResourceRef::new("test", "web"))
            .await
            .unwrap();

        let stored = virtual_cluster.stored::<Endpoints>();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].metadata.name.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn no_virtual_service_means_nothing_is_created() {
        let virtual_cluster = FakeCluster::new();
        let physical_cluster = FakeCluster::new();
        physical_cluster.insert(&physical_endpoints(&["10.0.0.9"]));

        controller(&virtual_cluster, &physical_cluster)
            .reconcile(&ResourceRef::new("test", "web"))
            .await
            .unwrap();

        assert!(virtual_cluster.stored::<Endpoints>().is_empty());
    }
}
