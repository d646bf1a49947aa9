//! Secret syncer.
//!
//! A secret is projected only while something demands it: a pod in the same
//! virtual namespace referencing it, or (when ingress sync is enabled) an
//! ingress using it for TLS. Demand is answered from the secondary indexes,
//! and lost demand tears the projection down.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::index::RefIndex;
use crate::translate::refs::ResourceRef;
use crate::translate::{equal_except, set_except, Translator, MARKER_LABEL};

pub struct SecretSyncer<P> {
    translator: Translator,
    physical_cluster: Arc<P>,
    index: Arc<RefIndex>,
    include_ingresses: bool,
}

impl<P: Cluster> SecretSyncer<P> {
    pub fn new(
        translator: Translator,
        physical_cluster: Arc<P>,
        index: Arc<RefIndex>,
        include_ingresses: bool,
    ) -> Self {
        Self {
            translator,
            physical_cluster,
            index,
            include_ingresses,
        }
    }

    fn is_used(&self, v: &Secret) -> bool {
        let key = ResourceRef::new(v.namespace().unwrap_or_default(), v.name_any()).key();
        if !self.index.pods_by_secret(&key).is_empty() {
            return true;
        }
        self.include_ingresses && !self.index.ingresses_by_secret(&key).is_empty()
    }
}

#[async_trait]
impl<P: Cluster> Syncer for SecretSyncer<P> {
    type Object = Secret;

    fn kind_name(&self) -> &'static str {
        "secrets"
    }

    async fn forward_create_needed(&self, v: &Secret) -> Result<bool> {
        Ok(self.is_used(v))
    }

    async fn forward_update_needed(&self, p: &Secret, v: &Secret) -> Result<bool> {
        Ok(p.data != v.data
            || p.string_data != v.string_data
            || p.type_ != v.type_
            || !equal_except(
                v.metadata.labels.as_ref(),
                p.metadata.labels.as_ref(),
                &[MARKER_LABEL],
            )
            || self.translator.desired_annotations(
                v.metadata.annotations.as_ref(),
                p.metadata.annotations.as_ref(),
            ) != p.metadata.annotations)
    }

    async fn forward_create(&self, v: &Secret) -> Result<Secret> {
        let mut p = v.clone();
        self.translator.translate_meta(&mut p.metadata);
        p.metadata.labels = set_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        );
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(&self, p: &Secret, v: &Secret) -> Result<Secret> {
        let mut updated = p.clone();
        updated.data = v.data.clone();
        updated.string_data = v.string_data.clone();
        updated.type_ = v.type_.clone();
        updated.metadata.labels = set_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        );
        updated.metadata.annotations = self.translator.desired_annotations(
            v.metadata.annotations.as_ref(),
            p.metadata.annotations.as_ref(),
        );
        self.physical_cluster.update(&updated).await
    }

    async fn forward_delete(&self, p: &Secret) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical secret has no namespace"))?;
        self.physical_cluster
            .delete::<Secret>(&namespace, &p.name_any())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::sync::events::NoopEventSink;
    use crate::sync::generic::SyncController;
    use k8s_openapi::api::core::v1::{Pod, PodSpec, SecretVolumeSource, Volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn translator() -> Translator {
        Translator::new("test", "suffix")
    }

    fn base_secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("test-secret".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn updated_secret() -> Secret {
        let mut secret = base_secret();
        let mut data = BTreeMap::new();
        data.insert("test".to_string(), ByteString(b"test".to_vec()));
        secret.data = Some(data);
        secret
    }

    fn synced_secret() -> Secret {
        let mut p = base_secret();
        let tr = translator();
        tr.translate_meta(&mut p.metadata);
        p
    }

    fn pod_using_base_secret() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("test".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "test".into(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some("test-secret".into()),
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

    struct Harness {
        controller: SyncController<SecretSyncer<FakeCluster>, FakeCluster, FakeCluster>,
        virtual_cluster: FakeCluster,
        physical_cluster: FakeCluster,
        index: Arc<RefIndex>,
    }

    fn harness() -> Harness {
        let virtual_cluster = FakeCluster::new();
        let physical_cluster = FakeCluster::new();
        let index = Arc::new(RefIndex::new());
        let syncer = Arc::new(SecretSyncer::new(
            translator(),
            Arc::new(physical_cluster.clone()),
            Arc::clone(&index),
            true,
        ));
        let controller = SyncController::new(
            syncer,
            Arc::new(virtual_cluster.clone()),
            Arc::new(physical_cluster.clone()),
            translator(),
            Arc::new(NoopEventSink),
        );
        Harness {
            controller,
            virtual_cluster,
            physical_cluster,
            index,
        }
    }

    fn secret_key() -> ResourceRef {
        ResourceRef::new("test", "test-secret")
    }

    #[tokio::test]
    async fn unused_secret_is_not_projected() {
        let h = harness();
        h.virtual_cluster.insert(&base_secret());

        assert!(!h
            .controller
            .syncer()
            .forward_create_needed(&base_secret())
            .await
            .unwrap());

        h.controller.reconcile(&secret_key()).await.unwrap();
        assert!(h.physical_cluster.stored::<Secret>().is_empty());
    }

    #[tokio::test]
    async fn used_secret_is_projected_under_translated_name() {
        let h = harness();
        h.virtual_cluster.insert(&base_secret());
        h.virtual_cluster.insert(&pod_using_base_secret());
        h.index.observe_pod(&pod_using_base_secret());

        assert!(h
            .controller
            .syncer()
            .forward_create_needed(&base_secret())
            .await
            .unwrap());

        h.controller.reconcile(&secret_key()).await.unwrap();

        let stored = h.physical_cluster.stored::<Secret>();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name_any(), "test-secret-x-test-x-suffix");
        assert_eq!(stored[0].namespace().as_deref(), Some("test"));
        assert!(translator().is_managed(&stored[0].metadata));
    }

    #[tokio::test]
    async fn updated_secret_data_flows_forward() {
        let h = harness();
        h.virtual_cluster.insert(&updated_secret());
        h.virtual_cluster.insert(&pod_using_base_secret());
        h.index.observe_pod(&pod_using_base_secret());
        h.physical_cluster.insert(&synced_secret());

        assert!(h
            .controller
            .syncer()
            .forward_update_needed(&synced_secret(), &updated_secret())
            .await
            .unwrap());

        h.controller.reconcile(&secret_key()).await.unwrap();

        let stored = h.physical_cluster.stored::<Secret>();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].data.as_ref().unwrap().get("test"),
            Some(&ByteString(b"test".to_vec()))
        );
    }

    #[tokio::test]
    async fn secret_without_demand_is_torn_down() {
        let h = harness();
        // The pod that used the secret is gone; the projection remains.
        h.virtual_cluster.insert(&updated_secret());
        h.physical_cluster.insert(&synced_secret());

        h.controller.reconcile(&secret_key()).await.unwrap();
        assert!(h.physical_cluster.stored::<Secret>().is_empty());
    }

    #[tokio::test]
    async fn deleted_virtual_secret_removes_projection() {
        let h = harness();
        h.physical_cluster.insert(&synced_secret());

        h.controller.reconcile(&secret_key()).await.unwrap();
        assert!(h.physical_cluster.stored::<Secret>().is_empty());
    }

    #[tokio::test]
    async fn unmanaged_collision_is_refused() {
        let h = harness();
        h.virtual_cluster.insert(&base_secret());
        h.virtual_cluster.insert(&pod_using_base_secret());
        h.index.observe_pod(&pod_using_base_secret());

        // Same translated name, but no managed marker: not ours.
        let mut squatter = synced_secret();
        squatter.metadata.labels = None;
        h.physical_cluster.insert(&squatter);

        let err = h.controller.reconcile(&secret_key()).await.unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        // The unmanaged object is untouched.
        assert_eq!(h.physical_cluster.stored::<Secret>().len(), 1);
    }

    #[tokio::test]
    async fn ingress_reference_keeps_secret_in_scope() {
        use k8s_openapi::api::networking::v1::{Ingress, IngressSpec, IngressTLS};

        let h = harness();
        let ingress = Ingress {
            metadata: ObjectMeta {
                name: Some("ing".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                tls: Some(vec![IngressTLS {
                    secret_name: Some("test-secret".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        h.index.observe_ingress(&ingress);

        assert!(h
            .controller
            .syncer()
            .forward_create_needed(&base_secret())
            .await
            .unwrap());
    }
}
