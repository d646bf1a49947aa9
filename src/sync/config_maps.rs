//! Config map syncer. Same demand model as secrets, minus the ingress path.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::index::RefIndex;
use crate::translate::refs::ResourceRef;
use crate::translate::{equal_except, set_except, Translator, MARKER_LABEL};

pub struct ConfigMapSyncer<P> {
    translator: Translator,
    physical_cluster: Arc<P>,
    index: Arc<RefIndex>,
}

impl<P: Cluster> ConfigMapSyncer<P> {
    pub fn new(translator: Translator, physical_cluster: Arc<P>, index: Arc<RefIndex>) -> Self {
        Self {
            translator,
            physical_cluster,
            index,
        }
    }
}

#[async_trait]
impl<P: Cluster> Syncer for ConfigMapSyncer<P> {
    type Object = ConfigMap;

    fn kind_name(&self) -> &'static str {
        "configmaps"
    }

    async fn forward_create_needed(&self, v: &ConfigMap) -> Result<bool> {
        let key = ResourceRef::new(v.namespace().unwrap_or_default(), v.name_any()).key();
        Ok(!self.index.pods_by_config_map(&key).is_empty())
    }

    async fn forward_update_needed(&self, p: &ConfigMap, v: &ConfigMap) -> Result<bool> {
        Ok(p.data != v.data
            || p.binary_data != v.binary_data
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

    async fn forward_create(&self, v: &ConfigMap) -> Result<ConfigMap> {
        let mut p = v.clone();
        self.translator.translate_meta(&mut p.metadata);
        p.metadata.labels = set_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        );
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(&self, p: &ConfigMap, v: &ConfigMap) -> Result<ConfigMap> {
        let mut updated = p.clone();
        updated.data = v.data.clone();
        updated.binary_data = v.binary_data.clone();
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

    async fn forward_delete(&self, p: &ConfigMap) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical configmap has no namespace"))?;
        self.physical_cluster
            .delete::<ConfigMap>(&namespace, &p.name_any())
            .await
    }
}
