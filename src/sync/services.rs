//! Service syncer.
//!
//! Ports and the (translated) selector flow forward; the cluster IP is only
//! copied when the tenant pinned one, otherwise the host allocates it and the
//! allocation flows backward onto the virtual spec together with node ports.
//! This is the one forward reconciler that reads the physical object before
//! writing the virtual one, so those reads are direct GETs.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::translate::{equal_except, set_except, Translator, MARKER_LABEL};

/// The physical projection of a virtual service, shared with the
/// service-create redirect so both paths produce identical objects
pub fn project_service(translator: &Translator, v: &Service) -> Service {
    let mut p = Service {
        metadata: v.metadata.clone(),
        spec: Some(desired_service_spec(translator, v, None)),
        ..Default::default()
    };
    translator.translate_meta(&mut p.metadata);
    p.metadata.labels = set_except(
        v.metadata.labels.as_ref(),
        p.metadata.labels.as_ref(),
        &[MARKER_LABEL],
    );
    p
}

fn desired_service_spec(translator: &Translator, v: &Service, p: Option<&Service>) -> ServiceSpec {
    let namespace = v.namespace().unwrap_or_default();
    let v_spec = v.spec.clone().unwrap_or_default();

    let mut spec = ServiceSpec {
        ports: desired_ports(v, p),
        selector: translator.selector_labels(v_spec.selector.as_ref(), &namespace),
        type_: v_spec.type_.clone(),
        external_name: v_spec.external_name.clone(),
        publish_not_ready_addresses: v_spec.publish_not_ready_addresses,
        ..Default::default()
    };

    // Only a tenant-pinned cluster IP flows forward; otherwise the host
    // allocator decides.
    match p.and_then(|p| p.spec.as_ref()).and_then(|s| s.cluster_ip.clone()) {
        Some(allocated) => spec.cluster_ip = Some(allocated),
        None => {
            if let Some(ip) = v_spec.cluster_ip.as_ref() {
                if !ip.is_empty() {
                    spec.cluster_ip = Some(ip.clone());
                }
            }
        }
    }
    spec
}

/// Ports the physical service should carry. Node ports are host-allocated:
/// existing physical allocations are kept, everything else is left for the
/// host to fill in.
fn desired_ports(v: &Service, p: Option<&Service>) -> Option<Vec<ServicePort>> {
    let v_ports = v.spec.as_ref()?.ports.as_ref()?;
    let p_ports = p.and_then(|p| p.spec.as_ref()).and_then(|s| s.ports.as_ref());

    Some(
        v_ports
            .iter()
            .map(|port| {
                let mut out = port.clone();
                out.node_port = p_ports
                    .and_then(|ports| {
                        ports
                            .iter()
                            .find(|c| c.port == port.port && c.protocol == port.protocol)
                    })
                    .and_then(|c| c.node_port);
                out
            })
            .collect(),
    )
}

pub struct ServiceSyncer<V, P> {
    translator: Translator,
    virtual_cluster: Arc<V>,
    physical_cluster: Arc<P>,
    /// The "service-controller" named lock; creation races the API proxy's
    /// service-create redirect on the same physical object
    create_lock: Arc<tokio::sync::Mutex<()>>,
}

impl<V: Cluster, P: Cluster> ServiceSyncer<V, P> {
    pub fn new(
        translator: Translator,
        virtual_cluster: Arc<V>,
        physical_cluster: Arc<P>,
        create_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            translator,
            virtual_cluster,
            physical_cluster,
            create_lock,
        }
    }
}

#[async_trait]
impl<V: Cluster, P: Cluster> Syncer for ServiceSyncer<V, P> {
    type Object = Service;

    fn kind_name(&self) -> &'static str {
        "services"
    }

    async fn forward_create_needed(&self, v: &Service) -> Result<bool> {
        // The default/kubernetes service fronts the virtual API server itself.
        Ok(!(v.namespace().as_deref() == Some("default") && v.name_any() == "kubernetes"))
    }

    async fn forward_update_needed(&self, p: &Service, v: &Service) -> Result<bool> {
        let desired = desired_service_spec(&self.translator, v, Some(p));
        let p_spec = p.spec.clone().unwrap_or_default();
        Ok(desired.ports != p_spec.ports
            || desired.selector != p_spec.selector
            || desired.type_ != p_spec.type_
            || desired.external_name != p_spec.external_name
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

    async fn backward_update_needed(&self, p: &Service, v: &Service) -> Result<bool> {
        let p_spec = p.spec.clone().unwrap_or_default();
        let v_spec = v.spec.clone().unwrap_or_default();

        if let Some(allocated) = p_spec.cluster_ip.as_ref() {
            if !allocated.is_empty() && v_spec.cluster_ip.as_ref() != Some(allocated) {
                return Ok(true);
            }
        }

        let v_ports = v_spec.ports.unwrap_or_default();
        for p_port in p_spec.ports.unwrap_or_default() {
            if p_port.node_port.is_none() {
                continue;
            }
            let matching = v_ports
                .iter()
                .find(|c| c.port == p_port.port && c.protocol == p_port.protocol);
            if matching.is_none_or(|c| c.node_port != p_port.node_port) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn forward_create(&self, v: &Service) -> Result<Service> {
        let p = project_service(&self.translator, v);
        // Serializes with the API proxy's service-create redirect.
        let _guard = self.create_lock.lock().await;
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(&self, p: &Service, v: &Service) -> Result<Service> {
        let mut updated = p.clone();
        updated.spec = Some(desired_service_spec(&self.translator, v, Some(p)));
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

    async fn forward_delete(&self, p: &Service) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical service has no namespace"))?;
        self.physical_cluster
            .delete::<Service>(&namespace, &p.name_any())
            .await
    }

    async fn backward_update(&self, p: &Service, v: &Service) -> Result<()> {
        let mut updated = v.clone();
        let mut v_spec = updated.spec.take().unwrap_or_default();
        let p_spec = p.spec.clone().unwrap_or_default();

        if let Some(allocated) = p_spec.cluster_ip.as_ref() {
            if !allocated.is_empty() {
                v_spec.cluster_ip = Some(allocated.clone());
            }
        }

        if let Some(v_ports) = v_spec.ports.as_mut() {
            for port in v_ports.iter_mut() {
                let matching = p_spec
                    .ports
                    .iter()
                    .flatten()
                    .find(|c| c.port == port.port && c.protocol == port.protocol);
                if let Some(allocated) = matching.and_then(|c| c.node_port) {
                    port.node_port = Some(allocated);
                }
            }
        }

        updated.spec = Some(v_spec);
        self.virtual_cluster.update(&updated).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use crate::sync::events::NoopEventSink;
    use crate::sync::generic::SyncController;
    use crate::translate::refs::ResourceRef;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn translator() -> Translator {
        Translator::new("host", "s1")
    }

    fn service(cluster_ip: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: cluster_ip.map(|s| s.to_string()),
                selector: Some(
                    [("app".to_string(), "web".to_string())]
                        .into_iter()
                        .collect::<BTreeMap<_, _>>(),
                ),
                ports: Some(vec![ServicePort {
                    port: 80,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn syncer(
        virtual_cluster: &FakeCluster,
        physical_cluster: &FakeCluster,
    ) -> ServiceSyncer<FakeCluster, FakeCluster> {
        ServiceSyncer::new(
            translator(),
            Arc::new(virtual_cluster.clone()),
            Arc::new(physical_cluster.clone()),
            Arc::new(tokio::sync::Mutex::new(())),
        )
    }

    #[tokio::test]
    async fn unpinned_cluster_ip_is_left_to_the_host() {
        let v = FakeCluster::new();
        let p = FakeCluster::new();
        let created = syncer(&v, &p).forward_create(&service(None)).await.unwrap();
        assert!(created.spec.as_ref().unwrap().cluster_ip.is_none());
    }

    #[tokio::test]
    async fn pinned_cluster_ip_flows_forward() {
        let v = FakeCluster::new();
        let p = FakeCluster::new();
        let created = syncer(&v, &p)
            .forward_create(&service(Some("10.96.7.7")))
            .await
            .unwrap();
        assert_eq!(
            created.spec.as_ref().unwrap().cluster_ip.as_deref(),
            Some("10.96.7.7")
        );
    }

    #[tokio::test]
    async fn selector_is_translated() {
        let v = FakeCluster::new();
        let p = FakeCluster::new();
        let created = syncer(&v, &p).forward_create(&service(None)).await.unwrap();
        let selector = created.spec.as_ref().unwrap().selector.as_ref().unwrap();
        assert!(!selector.contains_key("app"));
        assert!(selector.contains_key(crate::translate::NAMESPACE_LABEL));
        assert!(selector.values().any(|v| v == "web"));
    }

    #[tokio::test]
    async fn allocated_ip_and_node_ports_flow_backward() {
        let virtual_cluster = FakeCluster::new();
        let physical_cluster = FakeCluster::new();

        let v = service(None);
        virtual_cluster.insert(&v);

        let mut p = syncer(&virtual_cluster, &physical_cluster)
            .forward_create(&v)
            .await
            .unwrap();
        {
            let spec = p.spec.as_mut().unwrap();
            spec.cluster_ip = Some("10.96.1.23".into());
            spec.ports.as_mut().unwrap()[0].node_port = Some(30123);
        }
        physical_cluster.insert(&p);

        let controller = SyncController::new(
            Arc::new(syncer(&virtual_cluster, &physical_cluster)),
            Arc::new(virtual_cluster.clone()),
            Arc::new(physical_cluster.clone()),
            translator(),
            Arc::new(NoopEventSink),
        );
        controller
            .reconcile(&ResourceRef::new("test", "web"))
            .await
            .unwrap();

        let stored = virtual_cluster.stored::<Service>();
        let spec = stored[0].spec.as_ref().unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.1.23"));
        assert_eq!(spec.ports.as_ref().unwrap()[0].node_port, Some(30123));
    }

    #[tokio::test]
    async fn default_kubernetes_service_is_not_projected() {
        let v = FakeCluster::new();
        let p = FakeCluster::new();
        let kubernetes = Service {
            metadata: ObjectMeta {
                name: Some("kubernetes".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!syncer(&v, &p)
            .forward_create_needed(&kubernetes)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn forward_update_keeps_host_allocations() {
        let virtual_cluster = FakeCluster::new();
        let physical_cluster = FakeCluster::new();
        let s = syncer(&virtual_cluster, &physical_cluster);

        let v = service(None);
        let mut p = s.forward_create(&v).await.unwrap();
        {
            let spec = p.spec.as_mut().unwrap();
            spec.cluster_ip = Some("10.96.1.23".into());
            spec.ports.as_mut().unwrap()[0].node_port = Some(30123);
        }
        physical_cluster.insert(&p);

        // No drift: the host-allocated fields are excluded from the diff.
        assert!(!s.forward_update_needed(&p, &v).await.unwrap());

        let mut v_changed = v.clone();
        v_changed.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 8080;
        assert!(s.forward_update_needed(&p, &v_changed).await.unwrap());

        let updated = s.forward_update(&p, &v_changed).await.unwrap();
        let spec = updated.spec.as_ref().unwrap();
        // The pinned allocation survives the update.
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.96.1.23"));
    }
}
