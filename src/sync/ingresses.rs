//! Ingress syncer.
//!
//! The spec flows forward with every service and TLS-secret reference pushed
//! through the translation function so the host ingress controller resolves
//! physical backends. The load-balancer status the host assigns flows back.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::{Ingress, IngressSpec};
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::translate::{equal_except, set_except, Translator, MARKER_LABEL};

pub struct IngressSyncer<V, P> {
    translator: Translator,
    virtual_cluster: Arc<V>,
    physical_cluster: Arc<P>,
}

impl<V: Cluster, P: Cluster> IngressSyncer<V, P> {
    pub fn new(translator: Translator, virtual_cluster: Arc<V>, physical_cluster: Arc<P>) -> Self {
        Self {
            translator,
            virtual_cluster,
            physical_cluster,
        }
    }

    fn translate_spec(&self, spec: &IngressSpec, namespace: &str) -> IngressSpec {
        let mut out = spec.clone();

        if let Some(backend) = out.default_backend.as_mut() {
            if let Some(service) = backend.service.as_mut() {
                service.name = self.translator.physical_name(&service.name, namespace);
            }
        }
        for rule in out.rules.iter_mut().flatten() {
            if let Some(http) = rule.http.as_mut() {
                for path in &mut http.paths {
                    if let Some(service) = path.backend.service.as_mut() {
                        service.name = self.translator.physical_name(&service.name, namespace);
                    }
                }
            }
        }
        for tls in out.tls.iter_mut().flatten() {
            if let Some(name) = tls.secret_name.take() {
                if !name.is_empty() {
                    tls.secret_name = Some(self.translator.physical_name(&name, namespace));
                }
            }
        }
        out
    }
}

#[async_trait]
impl<V: Cluster, P: Cluster> Syncer for IngressSyncer<V, P> {
    type Object = Ingress;

    fn kind_name(&self) -> &'static str {
        "ingresses"
    }

    async fn forward_create_needed(&self, _v: &Ingress) -> Result<bool> {
        Ok(true)
    }

    async fn forward_update_needed(&self, p: &Ingress, v: &Ingress) -> Result<bool> {
        let namespace = v.namespace().unwrap_or_default();
        let desired = v.spec.as_ref().map(|s| self.translate_spec(s, &namespace));
        Ok(desired != p.spec
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

    async fn backward_update_needed(&self, p: &Ingress, v: &Ingress) -> Result<bool> {
        Ok(p.status != v.status)
    }

    async fn forward_create(&self, v: &Ingress) -> Result<Ingress> {
        let namespace = v.namespace().unwrap_or_default();
        let mut p = Ingress {
            metadata: v.metadata.clone(),
            spec: v.spec.as_ref().map(|s| self.translate_spec(s, &namespace)),
            status: None,
        };
        self.translator.translate_meta(&mut p.metadata);
        p.metadata.labels = set_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        );
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(&self, p: &Ingress, v: &Ingress) -> Result<Ingress> {
        let namespace = v.namespace().unwrap_or_default();
        let mut updated = p.clone();
        updated.spec = v.spec.as_ref().map(|s| self.translate_spec(s, &namespace));
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

    async fn forward_delete(&self, p: &Ingress) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical ingress has no namespace"))?;
        self.physical_cluster
            .delete::<Ingress>(&namespace, &p.name_any())
            .await
    }

    async fn backward_update(&self, p: &Ingress, v: &Ingress) -> Result<()> {
        let mut updated = v.clone();
        updated.status = p.status.clone();
        self.virtual_cluster.update_status(&updated).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeCluster;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
        IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn translator() -> Translator {
        Translator::new("host", "s1")
    }

    fn ingress() -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("test".into()),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some("web.example.com".into()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".into()),
                            path_type: "Prefix".into(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: "web".into(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(80),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                tls: Some(vec![IngressTLS {
                    secret_name: Some("web-tls".into()),
                    hosts: Some(vec!["web.example.com".into()]),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn syncer() -> IngressSyncer<FakeCluster, FakeCluster> {
        IngressSyncer::new(
            translator(),
            Arc::new(FakeCluster::new()),
            Arc::new(FakeCluster::new()),
        )
    }

    #[tokio::test]
    async fn backends_and_tls_secrets_are_translated() {
        let created = syncer().forward_create(&ingress()).await.unwrap();
        let spec = created.spec.as_ref().unwrap();

        let backend = spec.rules.as_ref().unwrap()[0]
            .http
            .as_ref()
            .unwrap()
            .paths[0]
            .backend
            .service
            .as_ref()
            .unwrap();
        assert_eq!(backend.name, "web-x-test-x-s1");

        let tls = &spec.tls.as_ref().unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("web-tls-x-test-x-s1"));
        // Hosts are tenant-facing and stay untouched.
        assert_eq!(tls.hosts.as_ref().unwrap()[0], "web.example.com");
    }

    #[tokio::test]
    async fn unchanged_ingress_does_not_drift() {
        let s = syncer();
        let v = ingress();
        let p = s.forward_create(&v).await.unwrap();
        assert!(!s.forward_update_needed(&p, &v).await.unwrap());

        let mut v_changed = v.clone();
        v_changed.spec.as_mut().unwrap().rules.as_mut().unwrap()[0].host =
            Some("other.example.com".into());
        assert!(s.forward_update_needed(&p, &v_changed).await.unwrap());
    }
}
