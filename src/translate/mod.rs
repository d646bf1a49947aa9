//! Name and metadata translation between the virtual and physical object
//! graphs.
//!
//! The translation function is pure and deterministic: the physical name of a
//! virtual object is derived from its name, namespace and the per-instance
//! suffix, never remembered. Reverse lookup goes through annotations stamped
//! at creation time (the hashed regime is not invertible).

pub mod refs;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use sha2::{Digest, Sha256};

/// Label identifying physical objects owned by a syncer instance.
/// The value is the instance suffix.
pub const MARKER_LABEL: &str = "burrow.dev/managed-by";

/// Label carrying the virtual namespace on physical pods, so selectors can
/// be scoped per tenant namespace.
pub const NAMESPACE_LABEL: &str = "burrow.dev/namespace";

/// Annotation carrying the virtual object name for O(1) reverse lookup
pub const NAME_ANNOTATION: &str = "burrow.dev/object-name";

/// Annotation carrying the virtual object namespace for O(1) reverse lookup
pub const NAMESPACE_ANNOTATION: &str = "burrow.dev/object-namespace";

/// Prefix for translated virtual label keys on physical pods
pub const LABEL_PREFIX: &str = "burrow.dev/label-";

/// Identity of the host StatefulSet that owns all projections
#[derive(Debug, Clone)]
pub struct OwnerRef {
    pub name: String,
    pub uid: String,
}

impl OwnerRef {
    /// Build from a fetched StatefulSet; `None` when it has no uid yet
    pub fn from_statefulset(sts: &StatefulSet) -> Option<Self> {
        let name = sts.metadata.name.clone()?;
        let uid = sts.metadata.uid.clone()?;
        Some(Self { name, uid })
    }
}

/// Joins parts with `-`; above 63 characters the result is truncated to 52
/// and suffixed with `-` plus the first 10 hex chars of the SHA-256 of the
/// untruncated string.
pub fn safe_concat(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() > 63 {
        let digest = Sha256::digest(full.as_bytes());
        let hex = hex_prefix(&digest, 10);
        format!("{}-{}", &full[0..52], hex)
    } else {
        full
    }
}

/// Translates a virtual label key into the syncer-owned physical key space
pub fn translate_label_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}{}", LABEL_PREFIX, hex_prefix(&digest, 8))
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        for nibble in [byte >> 4, byte & 0xf] {
            out.push(char::from_digit(nibble as u32, 16).unwrap());
            if out.len() == chars {
                return out;
            }
        }
    }
    out
}

/// Compare two label/annotation maps ignoring the listed keys, in both
/// directions (a key present on one side only is a difference).
pub fn equal_except(
    a: Option<&BTreeMap<String, String>>,
    b: Option<&BTreeMap<String, String>>,
    except: &[&str],
) -> bool {
    let empty = BTreeMap::new();
    let a = a.unwrap_or(&empty);
    let b = b.unwrap_or(&empty);

    for (k, v) in a {
        if except.contains(&k.as_str()) {
            continue;
        }
        if b.get(k) != Some(v) {
            return false;
        }
    }
    for (k, v) in b {
        if except.contains(&k.as_str()) {
            continue;
        }
        if a.get(k) != Some(v) {
            return false;
        }
    }
    true
}

/// Desired map built from `from`, with the listed keys taken from `to`
/// instead (the side that legitimately owns them). Returns `None` when the
/// result is empty, matching optional metadata fields.
pub fn set_except(
    from: Option<&BTreeMap<String, String>>,
    to: Option<&BTreeMap<String, String>>,
    except: &[&str],
) -> Option<BTreeMap<String, String>> {
    let mut ret = BTreeMap::new();
    if let Some(from) = from {
        for (k, v) in from {
            if except.contains(&k.as_str()) {
                continue;
            }
            ret.insert(k.clone(), v.clone());
        }
    }
    if let Some(to) = to {
        for k in except {
            if let Some(v) = to.get(*k) {
                if !v.is_empty() {
                    ret.insert((*k).to_string(), v.clone());
                }
            }
        }
    }
    if ret.is_empty() {
        None
    } else {
        Some(ret)
    }
}

/// Resets metadata fields the physical side must not inherit. Name,
/// namespace and annotations survive. Idempotent.
pub fn reset_metadata(meta: &mut ObjectMeta) {
    meta.generate_name = None;
    meta.uid = None;
    meta.resource_version = None;
    meta.generation = None;
    meta.creation_timestamp = None;
    meta.deletion_timestamp = None;
    meta.deletion_grace_period_seconds = None;
    meta.owner_references = None;
    meta.finalizers = None;
    meta.managed_fields = None;
    meta.labels = None;
}

/// Carries the per-instance identity needed to translate object metadata
#[derive(Debug, Clone)]
pub struct Translator {
    target_namespace: String,
    suffix: String,
    owner: Option<OwnerRef>,
}

impl Translator {
    pub fn new(target_namespace: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            target_namespace: target_namespace.into(),
            suffix: suffix.into(),
            owner: None,
        }
    }

    /// Configure the owning StatefulSet stamped on every created projection
    pub fn with_owner(mut self, owner: Option<OwnerRef>) -> Self {
        self.owner = owner;
        self
    }

    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// The physical name of the (virtual name, virtual namespace) resource
    pub fn physical_name(&self, name: &str, namespace: &str) -> String {
        safe_concat(&[name, "x", namespace, "x", &self.suffix])
    }

    /// Whether a physical object carries this instance's managed marker
    pub fn is_managed(&self, meta: &ObjectMeta) -> bool {
        meta.labels
            .as_ref()
            .and_then(|l| l.get(MARKER_LABEL))
            .is_some_and(|v| v == &self.suffix)
    }

    /// The virtual (namespace, name) a physical object was projected from,
    /// read from the reverse-lookup annotations
    pub fn virtual_ref(&self, meta: &ObjectMeta) -> Option<refs::ResourceRef> {
        let annotations = meta.annotations.as_ref()?;
        let name = annotations.get(NAME_ANNOTATION)?;
        let namespace = annotations.get(NAMESPACE_ANNOTATION)?;
        Some(refs::ResourceRef::new(namespace, name))
    }

    /// Rewrites metadata for the physical side: reset, translated name,
    /// target namespace, managed marker, reverse-lookup annotations, and the
    /// owning controller reference when configured.
    pub fn translate_meta(&self, meta: &mut ObjectMeta) {
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();

        reset_metadata(meta);
        meta.name = Some(self.physical_name(&name, &namespace));
        meta.namespace = Some(self.target_namespace.clone());

        let labels = meta.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(MARKER_LABEL.to_string(), self.suffix.clone());

        let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(NAME_ANNOTATION.to_string(), name);
        annotations.insert(NAMESPACE_ANNOTATION.to_string(), namespace);

        if let Some(owner) = &self.owner {
            meta.owner_references = Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "StatefulSet".to_string(),
                name: owner.name.clone(),
                uid: owner.uid.clone(),
                ..Default::default()
            }]);
        }
    }

    /// Desired physical labels for a pod: every virtual key translated into
    /// the syncer-owned key space, plus the namespace label and the marker.
    /// Service selectors are translated with the same key function, which is
    /// what keeps host-side endpoint selection working.
    pub fn pod_labels(
        &self,
        virtual_labels: Option<&BTreeMap<String, String>>,
        virtual_namespace: &str,
    ) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        if let Some(virtual_labels) = virtual_labels {
            for (k, v) in virtual_labels {
                labels.insert(translate_label_key(k), v.clone());
            }
        }
        labels.insert(NAMESPACE_LABEL.to_string(), virtual_namespace.to_string());
        labels.insert(MARKER_LABEL.to_string(), self.suffix.clone());
        labels
    }

    /// Translate a service selector into the physical pod label space
    pub fn selector_labels(
        &self,
        selector: Option<&BTreeMap<String, String>>,
        virtual_namespace: &str,
    ) -> Option<BTreeMap<String, String>> {
        let selector = selector?;
        let mut out = BTreeMap::new();
        for (k, v) in selector {
            out.insert(translate_label_key(k), v.clone());
        }
        out.insert(NAMESPACE_LABEL.to_string(), virtual_namespace.to_string());
        out.insert(MARKER_LABEL.to_string(), self.suffix.clone());
        Some(out)
    }

    /// Desired physical annotations: the virtual annotations with the
    /// reverse-lookup keys preserved from the physical side
    pub fn desired_annotations(
        &self,
        virtual_annotations: Option<&BTreeMap<String, String>>,
        physical_annotations: Option<&BTreeMap<String, String>>,
    ) -> Option<BTreeMap<String, String>> {
        set_except(
            virtual_annotations,
            physical_annotations,
            &[NAME_ANNOTATION, NAMESPACE_ANNOTATION],
        )
    }
}
