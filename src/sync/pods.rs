//! Pod syncer.
//!
//! Pods are always in scope: the host kubelet is the only thing that can run
//! them. Forward create rewrites every reference a pod carries (secrets,
//! config maps, the service account, its subdomain) through the translation
//! function, clears scheduling decisions so the host scheduler picks a node,
//! and points DNS at the virtual cluster's resolver. Status flows backward
//! verbatim on every reconcile.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EphemeralContainer, Pod, PodDNSConfig, PodDNSConfigOption, PodSpec,
};
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::translate::Translator;

pub struct PodSyncer<V, P> {
    translator: Translator,
    virtual_cluster: Arc<V>,
    physical_cluster: Arc<P>,
    dns_ip: Option<IpAddr>,
}

impl<V: Cluster, P: Cluster> PodSyncer<V, P> {
    pub fn new(
        translator: Translator,
        virtual_cluster: Arc<V>,
        physical_cluster: Arc<P>,
        dns_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            translator,
            virtual_cluster,
            physical_cluster,
            dns_ip,
        }
    }

    fn translate_container(&self, container: &mut Container, namespace: &str) {
        for env in container.env.iter_mut().flatten() {
            if let Some(value_from) = env.value_from.as_mut() {
                if let Some(sel) = value_from.secret_key_ref.as_mut() {
                    if !sel.name.is_empty() {
                        sel.name = self.translator.physical_name(&sel.name.clone(), namespace);
                    }
                }
                if let Some(sel) = value_from.config_map_key_ref.as_mut() {
                    if !sel.name.is_empty() {
                        sel.name = self.translator.physical_name(&sel.name.clone(), namespace);
                    }
                }
            }
        }
        for from in container.env_from.iter_mut().flatten() {
            if let Some(sec) = from.secret_ref.as_mut() {
                if !sec.name.is_empty() {
                    sec.name = self.translator.physical_name(&sec.name.clone(), namespace);
                }
            }
            if let Some(cm) = from.config_map_ref.as_mut() {
                if !cm.name.is_empty() {
                    cm.name = self.translator.physical_name(&cm.name.clone(), namespace);
                }
            }
        }
    }

    fn translate_ephemeral(&self, container: &mut EphemeralContainer, namespace: &str) {
        for env in container.env.iter_mut().flatten() {
            if let Some(value_from) = env.value_from.as_mut() {
                if let Some(sel) = value_from.secret_key_ref.as_mut() {
                    if !sel.name.is_empty() {
                        sel.name = self.translator.physical_name(&sel.name.clone(), namespace);
                    }
                }
                if let Some(sel) = value_from.config_map_key_ref.as_mut() {
                    if !sel.name.is_empty() {
                        sel.name = self.translator.physical_name(&sel.name.clone(), namespace);
                    }
                }
            }
        }
        for from in container.env_from.iter_mut().flatten() {
            if let Some(sec) = from.secret_ref.as_mut() {
                if !sec.name.is_empty() {
                    sec.name = self.translator.physical_name(&sec.name.clone(), namespace);
                }
            }
            if let Some(cm) = from.config_map_ref.as_mut() {
                if !cm.name.is_empty() {
                    cm.name = self.translator.physical_name(&cm.name.clone(), namespace);
                }
            }
        }
    }

    fn translate_spec(&self, spec: &mut PodSpec, virtual_name: &str, namespace: &str) {
        if let Some(sa) = spec.service_account_name.take() {
            if !sa.is_empty() {
                spec.service_account_name = Some(self.translator.physical_name(&sa, namespace));
            }
        }
        // Deprecated alias; the translated serviceAccountName is canonical.
        spec.service_account = None;

        for pull in spec.image_pull_secrets.iter_mut().flatten() {
            if !pull.name.is_empty() {
                pull.name = self.translator.physical_name(&pull.name.clone(), namespace);
            }
        }

        for volume in spec.volumes.iter_mut().flatten() {
            if let Some(secret) = volume.secret.as_mut() {
                if let Some(name) = secret.secret_name.take() {
                    secret.secret_name = Some(self.translator.physical_name(&name, namespace));
                }
            }
            if let Some(cm) = volume.config_map.as_mut() {
                if !cm.name.is_empty() {
                    cm.name = self.translator.physical_name(&cm.name.clone(), namespace);
                }
            }
        }

        for container in &mut spec.containers {
            self.translate_container(container, namespace);
        }
        for container in spec.init_containers.iter_mut().flatten() {
            self.translate_container(container, namespace);
        }
        for container in spec.ephemeral_containers.iter_mut().flatten() {
            self.translate_ephemeral(container, namespace);
        }

        // The host scheduler picks the node.
        spec.node_name = None;

        // Name resolution must go through the virtual cluster's DNS service,
        // not the host's.
        if let Some(dns_ip) = self.dns_ip {
            spec.dns_policy = Some("None".to_string());
            spec.dns_config = Some(PodDNSConfig {
                nameservers: Some(vec![dns_ip.to_string()]),
                searches: Some(vec![
                    format!("{namespace}.svc.cluster.local"),
                    "svc.cluster.local".to_string(),
                    "cluster.local".to_string(),
                ]),
                options: Some(vec![PodDNSConfigOption {
                    name: Some("ndots".to_string()),
                    value: Some("5".to_string()),
                }]),
            });
        }

        // Keep the virtual identity: the physical pod name is unreadable, so
        // a pod without an explicit hostname gets its virtual name.
        if spec.hostname.is_none() && virtual_name.len() <= 63 {
            spec.hostname = Some(virtual_name.to_string());
        }
        if let Some(subdomain) = spec.subdomain.take() {
            if !subdomain.is_empty() {
                spec.subdomain = Some(self.translator.physical_name(&subdomain, namespace));
            }
        }
    }
}

#[async_trait]
impl<V: Cluster, P: Cluster> Syncer for PodSyncer<V, P> {
    type Object = Pod;

    fn kind_name(&self) -> &'static str {
        "pods"
    }

    async fn forward_create_needed(&self, _v: &Pod) -> Result<bool> {
        Ok(true)
    }

    async fn forward_update_needed(&self, p: &Pod, v: &Pod) -> Result<bool> {
        let namespace = v.namespace().unwrap_or_default();
        let desired_labels = self
            .translator
            .pod_labels(v.metadata.labels.as_ref(), &namespace);
        Ok(p.metadata.labels.as_ref() != Some(&desired_labels)
            || self.translator.desired_annotations(
                v.metadata.annotations.as_ref(),
                p.metadata.annotations.as_ref(),
            ) != p.metadata.annotations)
    }

    async fn backward_update_needed(&self, p: &Pod, v: &Pod) -> Result<bool> {
        Ok(p.status != v.status)
    }

    async fn forward_create(&self, v: &Pod) -> Result<Pod> {
        let virtual_name = v.name_any();
        let namespace = v.namespace().unwrap_or_default();

        let mut p = v.clone();
        p.status = None;
        self.translator.translate_meta(&mut p.metadata);
        p.metadata.labels = Some(
            self.translator
                .pod_labels(v.metadata.labels.as_ref(), &namespace),
        );
        if let Some(spec) = p.spec.as_mut() {
            self.translate_spec(spec, &virtual_name, &namespace);
        }
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(&self, p: &Pod, v: &Pod) -> Result<Pod> {
        let namespace = v.namespace().unwrap_or_default();
        let mut updated = p.clone();
        updated.metadata.labels = Some(
            self.translator
                .pod_labels(v.metadata.labels.as_ref(), &namespace),
        );
        updated.metadata.annotations = self.translator.desired_annotations(
            v.metadata.annotations.as_ref(),
            p.metadata.annotations.as_ref(),
        );
        self.physical_cluster.update(&updated).await
    }

    async fn forward_delete(&self, p: &Pod) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical pod has no namespace"))?;
        self.physical_cluster
            .delete::<Pod>(&namespace, &p.name_any())
            .await
    }

    async fn backward_update(&self, p: &Pod, v: &Pod) -> Result<()> {
        let mut updated = v.clone();
        updated.status = p.status.clone();
        self.virtual_cluster.update_status(&updated).await?;
        Ok(())
    }
}
