//! Service account syncer.
//!
//! Only the identity is projected: the host control plane wires up tokens
//! and pull secrets for the physical account itself. A service account is in
//! scope while some pod in its namespace runs as it.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::ResourceExt;

use super::Syncer;
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::index::RefIndex;
use crate::translate::refs::ResourceRef;
use crate::translate::{equal_except, set_except, Translator, MARKER_LABEL};

pub struct ServiceAccountSyncer<P> {
    translator: Translator,
    physical_cluster: Arc<P>,
    index: Arc<RefIndex>,
}

impl<P: Cluster> ServiceAccountSyncer<P> {
    pub fn new(translator: Translator, physical_cluster: Arc<P>, index: Arc<RefIndex>) -> Self {
        Self {
            translator,
            physical_cluster,
            index,
        }
    }
}

#[async_trait]
impl<P: Cluster> Syncer for ServiceAccountSyncer<P> {
    type Object = ServiceAccount;

    fn kind_name(&self) -> &'static str {
        "serviceaccounts"
    }

    async fn forward_create_needed(&self, v: &ServiceAccount) -> Result<bool> {
        let key = ResourceRef::new(v.namespace().unwrap_or_default(), v.name_any()).key();
        Ok(!self.index.pods_by_service_account(&key).is_empty())
    }

    async fn forward_update_needed(&self, p: &ServiceAccount, v: &ServiceAccount) -> Result<bool> {
        Ok(!equal_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        ) || self.translator.desired_annotations(
            v.metadata.annotations.as_ref(),
            p.metadata.annotations.as_ref(),
        ) != p.metadata.annotations)
    }

    async fn forward_create(&self, v: &ServiceAccount) -> Result<ServiceAccount> {
        let mut p = ServiceAccount {
            metadata: v.metadata.clone(),
            // Token and pull-secret references stay host-local.
            automount_service_account_token: v.automount_service_account_token,
            ..Default::default()
        };
        self.translator.translate_meta(&mut p.metadata);
        p.metadata.labels = set_except(
            v.metadata.labels.as_ref(),
            p.metadata.labels.as_ref(),
            &[MARKER_LABEL],
        );
        self.physical_cluster.create(&p).await
    }

    async fn forward_update(&self, p: &ServiceAccount, v: &ServiceAccount) -> Result<ServiceAccount> {
        let mut updated = p.clone();
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

    async fn forward_delete(&self, p: &ServiceAccount) -> Result<()> {
        let namespace = p
            .namespace()
            .ok_or_else(|| Error::validation("physical service account has no namespace"))?;
        self.physical_cluster
            .delete::<ServiceAccount>(&namespace, &p.name_any())
            .await
    }
}
