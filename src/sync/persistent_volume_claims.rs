//! Persistent volume claim syncer.
//!
//! The claim spec flows forward; binding happens host-side, so the bound
//! volume name and the claim status flow backward. Only the resource request
//! is mutable after creation (volume expansion).

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::translate::{equal_except, set_except, Translator, MARKER_LABEL};

pub struct PersistentVolumeClaimSyncer<V, P> {
    translator: Translator,
    virtual_cluster: Arc<V>,
    physical_cluster: Arc<P>,
}

impl<V: Cluster, P: Cluster> PersistentVolumeClaimSyncer<V, P> {
    pub fn new(translator: Translator, virtual_cluster: Arc<V>, physical_cluster: Arc<P>) -> Self {
        Self {
            translator,
            virtual_cluster,
            physical_cluster,
        }
    }
}

#[async_trait]
impl<V: Cluster, P: Cluster> Syncer for PersistentVolumeClaimSyncer<V, P> {
    type Object = PersistentVolumeClaim;

    fn kind_name(&self) -> &'static str {
        "persistentvolumeclaims"
    }

    async fn forward_create_needed(&self, _v: &PersistentVolumeClaim) -> Result<bool> {
        Ok(true)
    }

    async fn forward_update_needed(
        &self,
        p: &PersistentVolumeClaim,
        v: &PersistentVolumeClaim,
    ) -> Result<bool> {
        let v_requests = v
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref());
        let p_requests = p
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref());
        Ok(v_requests != p_requests
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

    async fn backward_update_needed(
        &self,
        p: &PersistentVolumeClaim,
        v: &PersistentVolumeClaim,
    ) -> Result<bool> {
        if p.status != v.status {
            return Ok(true);
        }
        let v_volume = v.spec.as_ref().and_then(|s| s.volume_name.as_ref());
        let p_volume = p.spec.as_ref().and_then(|s| s.volume_name.as_ref());
        Ok(v_volume.is_none() && p_volume.is_some())
    }

    async fn forward_create(&self, v: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let mut p = v.clone();
        p.status = None;
        // The host binds its own volume.
        if let Some(spec) = p.spec.as_mut() {
            spec.volume_name = None;
        }
        self.translator.translate_meta(&mut p.metadata);
        p.metadata.labels = set_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        );
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(
        &self,
        p: &PersistentVolumeClaim,
        v: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let mut updated = p.clone();
        if let (Some(spec), Some(v_spec)) = (updated.spec.as_mut(), v.spec.as_ref()) {
            spec.resources = v_spec.resources.clone();
        }
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

    async fn forward_delete(&self, p: &PersistentVolumeClaim) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical claim has no namespace"))?;
        self.physical_cluster
            .delete::<PersistentVolumeClaim>(&namespace, &p.name_any())
            .await
    }

    async fn backward_update(
        &self,
        p: &PersistentVolumeClaim,
        v: &PersistentVolumeClaim,
    ) -> Result<()> {
        let mut updated = v.clone();

        let bound_volume = p.spec.as_ref().and_then(|s| s.volume_name.clone());
        let needs_spec_write = updated
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.as_ref())
            .is_none()
            && bound_volume.is_some();
        if needs_spec_write {
            if let Some(spec) = updated.spec.as_mut() {
                spec.volume_name = bound_volume;
            }
            updated = self.virtual_cluster.update(&updated).await?;
        }

        if p.status != updated.status {
            updated.status = p.status.clone();
            self.virtual_cluster.update_status(&updated).await?;
        }
        Ok(())
    }
}
