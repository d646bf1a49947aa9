//! Wires watch streams to work queues and runs the per-kind workers.
//!
//! Virtual events enqueue their own key plus, for pods and ingresses, every
//! reference they carry so scope decisions get re-evaluated. Physical events
//! are reverse-translated through the stamped annotations (never by parsing
//! the name) and enqueue the virtual key of the same kind.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Resource, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::config_maps::ConfigMapSyncer;
use super::endpoints::EndpointsSyncer;
use super::events::{EventSink, KubeEventSink};
use super::generic::SyncController;
use super::ingresses::IngressSyncer;
use super::persistent_volume_claims::PersistentVolumeClaimSyncer;
use super::pods::PodSyncer;
use super::queue::WorkQueue;
use super::secrets::SecretSyncer;
use super::service_accounts::ServiceAccountSyncer;
use super::services::ServiceSyncer;
use super::Syncer;
use crate::client::{KubeCluster, SyncedObject};
use crate::config::SyncerConfig;
use crate::error::Result;
use crate::index::{NameCache, RefIndex};
use crate::metrics::MANAGED_OBJECTS;
use crate::translate::refs::{
    config_maps_referenced_by_pod, secrets_referenced_by_ingress, secrets_referenced_by_pod,
    service_account_referenced_by_pod, ResourceRef,
};
use crate::translate::{Translator, MARKER_LABEL};

/// How long in-flight reconciles may finish after shutdown begins
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Owns the queues, indexes, and worker/watcher tasks of the sync engine
pub struct SyncManager {
    config: SyncerConfig,
    translator: Translator,
    virtual_cluster: Arc<KubeCluster>,
    physical_cluster: Arc<KubeCluster>,
    index: Arc<RefIndex>,
    name_cache: Arc<NameCache>,
    events: Arc<dyn EventSink>,
    /// The "service-controller" lock shared with the API proxy
    service_lock: Arc<tokio::sync::Mutex<()>>,

    secrets: Arc<WorkQueue>,
    config_maps: Arc<WorkQueue>,
    service_accounts: Arc<WorkQueue>,
    pods: Arc<WorkQueue>,
    services: Arc<WorkQueue>,
    endpoints: Arc<WorkQueue>,
    ingresses: Arc<WorkQueue>,
    claims: Arc<WorkQueue>,
}

impl SyncManager {
    pub fn new(
        config: SyncerConfig,
        translator: Translator,
        virtual_cluster: Arc<KubeCluster>,
        physical_cluster: Arc<KubeCluster>,
        index: Arc<RefIndex>,
        name_cache: Arc<NameCache>,
        service_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        let events: Arc<dyn EventSink> =
            Arc::new(KubeEventSink::new(virtual_cluster.client(), "burrow-syncer"));
        Self {
            config,
            translator,
            virtual_cluster,
            physical_cluster,
            index,
            name_cache,
            events,
            service_lock,
            secrets: WorkQueue::new(),
            config_maps: WorkQueue::new(),
            service_accounts: WorkQueue::new(),
            pods: WorkQueue::new(),
            services: WorkQueue::new(),
            endpoints: WorkQueue::new(),
            ingresses: WorkQueue::new(),
            claims: WorkQueue::new(),
        }
    }

    fn ingress_sync_enabled(&self) -> bool {
        !self.config.kind_disabled("ingresses")
    }

    /// Start every watcher and worker; runs until the token is cancelled,
    /// then drains in-flight reconciles up to the grace deadline.
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut tasks = Vec::new();
        tasks.extend(self.clone().spawn_workers(&token));
        tasks.extend(self.clone().spawn_virtual_watchers(&token));
        tasks.extend(self.clone().spawn_physical_watchers(&token));

        info!(
            target_namespace = %self.config.target_namespace,
            suffix = %self.translator.suffix(),
            "sync manager started"
        );

        token.cancelled().await;
        info!("shutting down sync manager");

        for queue in self.queues() {
            queue.shut_down();
        }
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            error!("shutdown grace deadline exceeded, abandoning in-flight reconciles");
        }
        Ok(())
    }

    fn queues(&self) -> Vec<Arc<WorkQueue>> {
        vec![
            Arc::clone(&self.secrets),
            Arc::clone(&self.config_maps),
            Arc::clone(&self.service_accounts),
            Arc::clone(&self.pods),
            Arc::clone(&self.services),
            Arc::clone(&self.endpoints),
            Arc::clone(&self.ingresses),
            Arc::clone(&self.claims),
        ]
    }

    fn controller<S>(&self, syncer: S) -> Arc<SyncController<S, KubeCluster, KubeCluster>>
    where
        S: Syncer + 'static,
    {
        Arc::new(SyncController::new(
            Arc::new(syncer),
            Arc::clone(&self.virtual_cluster),
            Arc::clone(&self.physical_cluster),
            self.translator.clone(),
            Arc::clone(&self.events),
        ))
    }

    fn spawn_workers(self: Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.config.workers;
        let mut handles = Vec::new();

        macro_rules! spawn_kind {
            ($kind:literal, $queue:expr, $syncer:expr) => {
                if !self.config.kind_disabled($kind) {
                    let controller = self.controller($syncer);
                    handles.extend(controller.spawn_workers(
                        Arc::clone(&$queue),
                        workers,
                        token.clone(),
                    ));
                } else {
                    info!(kind = $kind, "kind disabled, not syncing");
                }
            };
        }

        spawn_kind!(
            "secrets",
            self.secrets,
            SecretSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.physical_cluster),
                Arc::clone(&self.index),
                self.ingress_sync_enabled(),
            )
        );
        spawn_kind!(
            "configmaps",
            self.config_maps,
            ConfigMapSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.physical_cluster),
                Arc::clone(&self.index),
            )
        );
        spawn_kind!(
            "serviceaccounts",
            self.service_accounts,
            ServiceAccountSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.physical_cluster),
                Arc::clone(&self.index),
            )
        );
        spawn_kind!(
            "pods",
            self.pods,
            PodSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.virtual_cluster),
                Arc::clone(&self.physical_cluster),
                self.config.dns_ip,
            )
        );
        spawn_kind!(
            "services",
            self.services,
            ServiceSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.virtual_cluster),
                Arc::clone(&self.physical_cluster),
                Arc::clone(&self.service_lock),
            )
        );
        spawn_kind!(
            "endpoints",
            self.endpoints,
            EndpointsSyncer::new(Arc::clone(&self.virtual_cluster))
        );
        spawn_kind!(
            "ingresses",
            self.ingresses,
            IngressSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.virtual_cluster),
                Arc::clone(&self.physical_cluster),
            )
        );
        spawn_kind!(
            "persistentvolumeclaims",
            self.claims,
            PersistentVolumeClaimSyncer::new(
                self.translator.clone(),
                Arc::clone(&self.virtual_cluster),
                Arc::clone(&self.physical_cluster),
            )
        );

        handles
    }

    /// Watch one API, feeding raw add/update/delete events to the handler
    /// with watch errors retried under backoff
    fn spawn_watch<K, F>(
        api: Api<K>,
        watch_config: watcher::Config,
        token: CancellationToken,
        what: &'static str,
        mut handle: F,
    ) -> JoinHandle<()>
    where
        K: SyncedObject,
        F: FnMut(watcher::Event<K>) + Send + 'static,
    {
        tokio::spawn(async move {
            let stream = watcher(api, watch_config).default_backoff();
            let mut stream = std::pin::pin!(stream);
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = stream.try_next() => event,
                };
                match event {
                    Ok(Some(event)) => handle(event),
                    Ok(None) => break,
                    Err(e) => {
                        error!(watch = what, error = %e, "watch stream error");
                    }
                }
            }
            debug!(watch = what, "watcher stopped");
        })
    }

    fn spawn_virtual_watchers(self: Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let client = self.virtual_cluster.client();
        let mut handles = Vec::new();

        // Kinds whose events only concern their own key.
        fn enqueue_own_key<K: SyncedObject>(queue: Arc<WorkQueue>) -> impl FnMut(watcher::Event<K>) {
            move |event| {
                let obj = match &event {
                    watcher::Event::Apply(obj)
                    | watcher::Event::InitApply(obj)
                    | watcher::Event::Delete(obj) => obj,
                    _ => return,
                };
                if let (Some(namespace), Some(name)) =
                    (obj.meta().namespace.clone(), obj.meta().name.clone())
                {
                    queue.add(ResourceRef::new(namespace, name));
                }
            }
        }

        if !self.config.kind_disabled("secrets") {
            handles.push(Self::spawn_watch(
                Api::<Secret>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual secrets",
                enqueue_own_key::<Secret>(Arc::clone(&self.secrets)),
            ));
        }
        if !self.config.kind_disabled("configmaps") {
            handles.push(Self::spawn_watch(
                Api::<ConfigMap>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual configmaps",
                enqueue_own_key::<ConfigMap>(Arc::clone(&self.config_maps)),
            ));
        }
        if !self.config.kind_disabled("serviceaccounts") {
            handles.push(Self::spawn_watch(
                Api::<ServiceAccount>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual serviceaccounts",
                enqueue_own_key::<ServiceAccount>(Arc::clone(&self.service_accounts)),
            ));
        }
        if !self.config.kind_disabled("services") {
            handles.push(Self::spawn_watch(
                Api::<Service>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual services",
                enqueue_own_key::<Service>(Arc::clone(&self.services)),
            ));
        }
        if !self.config.kind_disabled("endpoints") {
            handles.push(Self::spawn_watch(
                Api::<Endpoints>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual endpoints",
                enqueue_own_key::<Endpoints>(Arc::clone(&self.endpoints)),
            ));
        }
        if !self.config.kind_disabled("persistentvolumeclaims") {
            handles.push(Self::spawn_watch(
                Api::<k8s_openapi::api::core::v1::PersistentVolumeClaim>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual persistentvolumeclaims",
                enqueue_own_key(Arc::clone(&self.claims)),
            ));
        }

        // Pod events fan out to everything the pod references so scope is
        // re-evaluated when demand appears or disappears.
        {
            let index = Arc::clone(&self.index);
            let pods = Arc::clone(&self.pods);
            let secrets = Arc::clone(&self.secrets);
            let config_maps = Arc::clone(&self.config_maps);
            let service_accounts = Arc::clone(&self.service_accounts);
            handles.push(Self::spawn_watch(
                Api::<Pod>::all(client.clone()),
                watcher::Config::default(),
                token.clone(),
                "virtual pods",
                move |event| {
                    let (pod, deleted) = match &event {
                        watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => (pod, false),
                        watcher::Event::Delete(pod) => (pod, true),
                        _ => return,
                    };
                    let Some(name) = pod.meta().name.clone() else {
                        return;
                    };
                    let pod_ref = ResourceRef::new(pod.namespace().unwrap_or_default(), name);

                    if deleted {
                        index.forget_pod(&pod_ref);
                    } else {
                        index.observe_pod(pod);
                    }
                    pods.add(pod_ref);
                    for r in secrets_referenced_by_pod(pod) {
                        secrets.add(r);
                    }
                    for r in config_maps_referenced_by_pod(pod) {
                        config_maps.add(r);
                    }
                    for r in service_account_referenced_by_pod(pod) {
                        service_accounts.add(r);
                    }
                },
            ));
        }

        if self.ingress_sync_enabled() {
            let index = Arc::clone(&self.index);
            let ingresses = Arc::clone(&self.ingresses);
            let secrets = Arc::clone(&self.secrets);
            handles.push(Self::spawn_watch(
                Api::<Ingress>::all(client),
                watcher::Config::default(),
                token.clone(),
                "virtual ingresses",
                move |event| {
                    let (ingress, deleted) = match &event {
                        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => (obj, false),
                        watcher::Event::Delete(obj) => (obj, true),
                        _ => return,
                    };
                    let Some(name) = ingress.meta().name.clone() else {
                        return;
                    };
                    let ingress_ref =
                        ResourceRef::new(ingress.namespace().unwrap_or_default(), name);

                    if deleted {
                        index.forget_ingress(&ingress_ref);
                    } else {
                        index.observe_ingress(ingress);
                    }
                    ingresses.add(ingress_ref);
                    for r in secrets_referenced_by_ingress(ingress) {
                        secrets.add(r);
                    }
                },
            ));
        }

        handles
    }

    fn spawn_physical_watchers(self: Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let client = self.physical_cluster.client();
        let namespace = self.config.target_namespace.clone();
        let managed = format!("{}={}", MARKER_LABEL, self.translator.suffix());
        let mut handles = Vec::new();

        // A physical event enqueues the virtual key it was projected from,
        // read off the stamped annotations; a gauge tracks live projections.
        fn managed_event_handler<K: SyncedObject>(
            translator: Translator,
            queue: Arc<WorkQueue>,
            name_cache: Option<Arc<NameCache>>,
            kind: &'static str,
        ) -> impl FnMut(watcher::Event<K>) {
            let mut known: HashSet<String> = HashSet::new();
            move |event| {
                let (obj, deleted) = match &event {
                    watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => (obj, false),
                    watcher::Event::Delete(obj) => (obj, true),
                    _ => return,
                };
                let Some(physical_name) = obj.meta().name.clone() else {
                    return;
                };
                if deleted {
                    if known.remove(&physical_name) {
                        MANAGED_OBJECTS.with_label_values(&[kind]).dec();
                    }
                } else if known.insert(physical_name.clone()) {
                    MANAGED_OBJECTS.with_label_values(&[kind]).inc();
                }

                let Some(virtual_ref) = translator.virtual_ref(obj.meta()) else {
                    debug!(kind, name = %physical_name, "managed object without reverse annotations");
                    return;
                };
                if let Some(cache) = &name_cache {
                    if deleted {
                        cache.forget(kind, &physical_name);
                    } else {
                        cache.record(kind, &physical_name, virtual_ref.clone());
                    }
                }
                queue.add(virtual_ref);
            }
        }

        macro_rules! spawn_managed {
            ($type:ty, $what:literal, $kind:literal, $queue:expr, $cache:expr) => {
                handles.push(Self::spawn_watch(
                    Api::<$type>::namespaced(client.clone(), &namespace),
                    watcher::Config::default().labels(&managed),
                    token.clone(),
                    $what,
                    managed_event_handler::<$type>(
                        self.translator.clone(),
                        Arc::clone(&$queue),
                        $cache,
                        $kind,
                    ),
                ));
            };
        }

        spawn_managed!(Secret, "physical secrets", "Secret", self.secrets, None);
        spawn_managed!(
            ConfigMap,
            "physical configmaps",
            "ConfigMap",
            self.config_maps,
            None
        );
        spawn_managed!(
            ServiceAccount,
            "physical serviceaccounts",
            "ServiceAccount",
            self.service_accounts,
            None
        );
        spawn_managed!(
            Pod,
            "physical pods",
            "Pod",
            self.pods,
            Some(Arc::clone(&self.name_cache))
        );
        spawn_managed!(
            Service,
            "physical services",
            "Service",
            self.services,
            Some(Arc::clone(&self.name_cache))
        );
        if self.ingress_sync_enabled() {
            spawn_managed!(
                Ingress,
                "physical ingresses",
                "Ingress",
                self.ingresses,
                None
            );
        }
        if !self.config.kind_disabled("persistentvolumeclaims") {
            spawn_managed!(
                k8s_openapi::api::core::v1::PersistentVolumeClaim,
                "physical persistentvolumeclaims",
                "PersistentVolumeClaim",
                self.claims,
                None
            );
        }

        // Host-generated endpoints carry the service's labels but not its
        // annotations; the service name cache supplies the reverse mapping.
        {
            let name_cache = Arc::clone(&self.name_cache);
            let endpoints = Arc::clone(&self.endpoints);
            handles.push(Self::spawn_watch(
                Api::<Endpoints>::namespaced(client, &namespace),
                watcher::Config::default(),
                token.clone(),
                "physical endpoints",
                move |event| {
                    let obj = match &event {
                        watcher::Event::Apply(obj)
                        | watcher::Event::InitApply(obj)
                        | watcher::Event::Delete(obj) => obj,
                        _ => return,
                    };
                    let Some(name) = obj.meta().name.as_deref() else {
                        return;
                    };
                    if let Some(virtual_ref) = name_cache.lookup("Service", name) {
                        endpoints.add(virtual_ref);
                    }
                },
            ));
        }

        handles
    }
}
