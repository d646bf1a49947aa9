//! Reference extraction: which other virtual objects does a virtual object
//! depend on.
//!
//! These are pure functions; callers feed the results into the secondary
//! indexes and into scope decisions. Output order is first-seen field order
//! and is part of the contract.

use k8s_openapi::api::core::v1::{Container, EphemeralContainer, Pod};
use k8s_openapi::api::networking::v1::Ingress;

/// A `(namespace, name)` pair identifying a virtual object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The `"<namespace>/<name>"` form used as index and queue key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn push_unique(out: &mut Vec<ResourceRef>, namespace: &str, name: &str) {
    if name.is_empty() {
        return;
    }
    let r = ResourceRef::new(namespace, name);
    if !out.contains(&r) {
        out.push(r);
    }
}

fn secrets_from_container(out: &mut Vec<ResourceRef>, namespace: &str, container: &Container) {
    for env in container.env.iter().flatten() {
        if let Some(sel) = env.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref()) {
            push_unique(out, namespace, sel.name.as_str());
        }
    }
    for from in container.env_from.iter().flatten() {
        if let Some(sec) = &from.secret_ref {
            push_unique(out, namespace, sec.name.as_str());
        }
    }
}

fn secrets_from_ephemeral(out: &mut Vec<ResourceRef>, namespace: &str, c: &EphemeralContainer) {
    for env in c.env.iter().flatten() {
        if let Some(sel) = env.value_from.as_ref().and_then(|v| v.secret_key_ref.as_ref()) {
            push_unique(out, namespace, sel.name.as_str());
        }
    }
    for from in c.env_from.iter().flatten() {
        if let Some(sec) = &from.secret_ref {
            push_unique(out, namespace, sec.name.as_str());
        }
    }
}

fn config_maps_from_container(out: &mut Vec<ResourceRef>, namespace: &str, container: &Container) {
    for env in container.env.iter().flatten() {
        if let Some(sel) = env
            .value_from
            .as_ref()
            .and_then(|v| v.config_map_key_ref.as_ref())
        {
            push_unique(out, namespace, sel.name.as_str());
        }
    }
    for from in container.env_from.iter().flatten() {
        if let Some(cm) = &from.config_map_ref {
            push_unique(out, namespace, cm.name.as_str());
        }
    }
}

fn config_maps_from_ephemeral(out: &mut Vec<ResourceRef>, namespace: &str, c: &EphemeralContainer) {
    for env in c.env.iter().flatten() {
        if let Some(sel) = env
            .value_from
            .as_ref()
            .and_then(|v| v.config_map_key_ref.as_ref())
        {
            push_unique(out, namespace, sel.name.as_str());
        }
    }
    for from in c.env_from.iter().flatten() {
        if let Some(cm) = &from.config_map_ref {
            push_unique(out, namespace, cm.name.as_str());
        }
    }
}

/// Secrets a pod depends on: container env and envFrom, then image pull
/// secrets, then secret volumes
pub fn secrets_referenced_by_pod(pod: &Pod) -> Vec<ResourceRef> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let mut out = Vec::new();
    let Some(spec) = &pod.spec else {
        return out;
    };

    for c in &spec.containers {
        secrets_from_container(&mut out, namespace, c);
    }
    for c in spec.init_containers.iter().flatten() {
        secrets_from_container(&mut out, namespace, c);
    }
    for c in spec.ephemeral_containers.iter().flatten() {
        secrets_from_ephemeral(&mut out, namespace, c);
    }
    for pull in spec.image_pull_secrets.iter().flatten() {
        push_unique(&mut out, namespace, &pull.name);
    }
    for volume in spec.volumes.iter().flatten() {
        if let Some(secret) = &volume.secret {
            if let Some(name) = &secret.secret_name {
                push_unique(&mut out, namespace, name);
            }
        }
    }
    out
}

/// Config maps a pod depends on: container env and envFrom, then configMap
/// volumes
pub fn config_maps_referenced_by_pod(pod: &Pod) -> Vec<ResourceRef> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let mut out = Vec::new();
    let Some(spec) = &pod.spec else {
        return out;
    };

    for c in &spec.containers {
        config_maps_from_container(&mut out, namespace, c);
    }
    for c in spec.init_containers.iter().flatten() {
        config_maps_from_container(&mut out, namespace, c);
    }
    for c in spec.ephemeral_containers.iter().flatten() {
        config_maps_from_ephemeral(&mut out, namespace, c);
    }
    for volume in spec.volumes.iter().flatten() {
        if let Some(cm) = &volume.config_map {
            push_unique(&mut out, namespace, &cm.name);
        }
    }
    out
}

/// TLS secrets an ingress depends on, in `spec.tls` order
pub fn secrets_referenced_by_ingress(ingress: &Ingress) -> Vec<ResourceRef> {
    let namespace = ingress.metadata.namespace.as_deref().unwrap_or_default();
    let mut out = Vec::new();
    let Some(spec) = &ingress.spec else {
        return out;
    };
    for tls in spec.tls.iter().flatten() {
        if let Some(name) = &tls.secret_name {
            push_unique(&mut out, namespace, name);
        }
    }
    out
}

/// The service account a pod runs as, when explicitly set
pub fn service_account_referenced_by_pod(pod: &Pod) -> Option<ResourceRef> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let name = pod.spec.as_ref()?.service_account_name.as_deref()?;
    if name.is_empty() {
        return None;
    }
    Some(ResourceRef::new(namespace, name))
}
