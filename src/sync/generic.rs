//! The generic per-key reconcile driver.
//!
//! Runs the object state machine over any [`Syncer`]:
//!
//! ```text
//! absent ──tenant create──► desired-not-yet-synced
//!                              │ forward_create
//!                              ▼
//!                         synced ◄──► drift (forward_update)
//!                              │
//!              demand lost OR  │ forward_delete
//!              tenant delete   ▼
//!                            absent
//! ```
//!
//! Ownership is enforced here: a physical object without this instance's
//! marker is never mutated. Conflicts are re-tried in-reconcile up to three
//! times before the key goes back to the queue with backoff.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info, warn};

use super::events::EventSink;
use super::queue::WorkQueue;
use super::{SyncDirection, Syncer};
use crate::client::Cluster;
use crate::error::{Error, Result};
use crate::metrics::{RECONCILES_TOTAL, RECONCILE_DURATION};
use crate::translate::refs::ResourceRef;
use crate::translate::Translator;

const CONFLICT_RETRIES: u32 = 3;

/// Drives one kind's reconciles between the two clusters
pub struct SyncController<S, V, P>
where
    S: Syncer,
    V: Cluster,
    P: Cluster,
{
    syncer: Arc<S>,
    virtual_cluster: Arc<V>,
    physical_cluster: Arc<P>,
    translator: Translator,
    events: Arc<dyn EventSink>,
}

impl<S, V, P> SyncController<S, V, P>
where
    S: Syncer + 'static,
    V: Cluster,
    P: Cluster,
{
    pub fn new(
        syncer: Arc<S>,
        virtual_cluster: Arc<V>,
        physical_cluster: Arc<P>,
        translator: Translator,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            syncer,
            virtual_cluster,
            physical_cluster,
            translator,
            events,
        }
    }

    pub fn syncer(&self) -> &S {
        &self.syncer
    }

    /// Reconcile one virtual key, retrying conflicts in place
    pub async fn reconcile(&self, key: &ResourceRef) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reconcile_once(key).await {
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    warn!(
                        kind = self.syncer.kind_name(),
                        key = %key,
                        attempt,
                        "conflict during reconcile, re-reading"
                    );
                }
                other => return other,
            }
        }
    }

    async fn reconcile_once(&self, key: &ResourceRef) -> Result<()> {
        let kind = self.syncer.kind_name();
        let physical_name = self.translator.physical_name(&key.name, &key.namespace);

        let v: Option<S::Object> = self
            .virtual_cluster
            .get(&key.namespace, &key.name)
            .await?;
        let p: Option<S::Object> = self
            .physical_cluster
            .get(self.translator.target_namespace(), &physical_name)
            .await?;

        match self.syncer.direction() {
            SyncDirection::Forward => self.reconcile_forward(key, kind, v, p).await,
            SyncDirection::Backward => self.reconcile_backward(key, kind, v, p).await,
        }
    }

    async fn reconcile_forward(
        &self,
        key: &ResourceRef,
        kind: &'static str,
        v: Option<S::Object>,
        p: Option<S::Object>,
    ) -> Result<()> {
        match (v, p) {
            (None, None) => Ok(()),

            (Some(v), None) => {
                if self.syncer.forward_create_needed(&v).await? {
                    info!(kind, key = %key, "creating physical object");
                    self.syncer.forward_create(&v).await?;
                } else {
                    debug!(kind, key = %key, "not in scope, skipping create");
                }
                Ok(())
            }

            (None, Some(p)) => {
                if self.translator.is_managed(p.meta()) {
                    info!(kind, key = %key, "virtual object gone, deleting physical");
                    self.syncer.forward_delete(&p).await?;
                } else {
                    debug!(kind, key = %key, "physical object not managed by us, ignoring");
                }
                Ok(())
            }

            (Some(v), Some(p)) => {
                if !self.translator.is_managed(p.meta()) {
                    let msg = format!(
                        "{kind} {key}: desired physical name is taken by an unmanaged object"
                    );
                    self.events
                        .publish(
                            &object_reference(&v),
                            EventType::Warning,
                            "SyncBlocked",
                            "Sync",
                            Some(msg.clone()),
                        )
                        .await;
                    return Err(Error::InvariantViolation(msg));
                }

                if !self.syncer.forward_create_needed(&v).await? {
                    info!(kind, key = %key, "demand lost, deleting physical object");
                    self.syncer.forward_delete(&p).await?;
                    return Ok(());
                }

                if self.syncer.forward_update_needed(&p, &v).await? {
                    info!(kind, key = %key, "updating physical object");
                    self.syncer.forward_update(&p, &v).await?;
                }
                if self.syncer.backward_update_needed(&p, &v).await? {
                    debug!(kind, key = %key, "propagating physical state backward");
                    self.syncer.backward_update(&p, &v).await?;
                }
                Ok(())
            }
        }
    }

    async fn reconcile_backward(
        &self,
        key: &ResourceRef,
        kind: &'static str,
        v: Option<S::Object>,
        p: Option<S::Object>,
    ) -> Result<()> {
        match (v, p) {
            (_, None) => Ok(()),
            (None, Some(p)) => {
                if self.syncer.backward_create(key, &p).await?.is_some() {
                    info!(kind, key = %key, "created virtual object from physical state");
                }
                Ok(())
            }
            (Some(v), Some(p)) => {
                if self.syncer.backward_update_needed(&p, &v).await? {
                    debug!(kind, key = %key, "propagating physical state backward");
                    self.syncer.backward_update(&p, &v).await?;
                }
                Ok(())
            }
        }
    }

    /// Spawn `workers` reconcile tasks draining `queue` until cancellation
    pub fn spawn_workers(
        self: Arc<Self>,
        queue: Arc<WorkQueue>,
        workers: usize,
        token: tokio_util::sync::CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>>
    where
        V: 'static,
        P: 'static,
    {
        (0..workers)
            .map(|worker| {
                let controller = Arc::clone(&self);
                let queue = Arc::clone(&queue);
                let token = token.clone();
                tokio::spawn(async move {
                    controller.worker_loop(queue, worker, token).await;
                })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        queue: Arc<WorkQueue>,
        worker: usize,
        token: tokio_util::sync::CancellationToken,
    ) {
        let kind = self.syncer.kind_name();
        debug!(kind, worker, "sync worker started");
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => break,
                key = queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let start = std::time::Instant::now();
            let result = self.reconcile(&key).await;
            RECONCILE_DURATION.observe(start.elapsed().as_secs_f64());
            let outcome = if result.is_ok() { "success" } else { "error" };
            RECONCILES_TOTAL.with_label_values(&[kind, outcome]).inc();

            match result {
                Ok(()) => queue.done(&key),
                Err(e) if e.is_forbidden() => {
                    // The installer owns RBAC; retrying will not help.
                    warn!(kind, key = %key, error = %e, "forbidden, not retrying");
                    queue.done(&key);
                }
                Err(e) => {
                    warn!(kind, key = %key, error = %e, "reconcile failed, requeueing");
                    queue.requeue_after_failure(key);
                }
            }
        }
        debug!(kind, worker, "sync worker stopped");
    }
}

/// Reference to a virtual object for event recording
pub fn object_reference<K>(obj: &K) -> ObjectReference
where
    K: Resource<DynamicType = ()>,
{
    ObjectReference {
        api_version: Some(K::api_version(&()).into_owned()),
        kind: Some(K::kind(&()).into_owned()),
        namespace: obj.meta().namespace.clone(),
        name: obj.meta().name.clone(),
        uid: obj.meta().uid.clone(),
        ..Default::default()
    }
}
