//! burrow syncer entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow::client::KubeCluster;
use burrow::config::{Flags, SyncerConfig};
use burrow::index::{NameCache, RefIndex};
use burrow::locks::LockFactory;
use burrow::retry;
use burrow::server::{self, ProxyState};
use burrow::sync::manager::SyncManager;
use burrow::translate::{OwnerRef, Translator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install crypto provider");

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = SyncerConfig::from_flags(Flags::parse())?;

    // The embedded control plane boots next to us; wait for its API server.
    let virtual_client = retry::with_backoff("connect to virtual API server", 0, || async {
        let client = virtual_client(&config).await?;
        client.apiserver_version().await?;
        Ok::<_, anyhow::Error>(client)
    })
    .await?;
    tracing::info!("virtual API server is reachable");

    let physical_client = kube::Client::try_default()
        .await
        .context("failed to create host API client")?;

    let owner = match &config.owning_statefulset {
        Some(name) => {
            let api: Api<StatefulSet> =
                Api::namespaced(physical_client.clone(), &config.target_namespace);
            let statefulset = api
                .get(name)
                .await
                .with_context(|| format!("owning statefulset {name} not found"))?;
            let owner = OwnerRef::from_statefulset(&statefulset)
                .context("owning statefulset has no uid yet")?;
            tracing::info!(name = %owner.name, uid = %owner.uid, "projections owned by statefulset");
            Some(owner)
        }
        None => None,
    };

    let translator =
        Translator::new(config.target_namespace.clone(), config.suffix.clone()).with_owner(owner);
    let virtual_cluster = Arc::new(KubeCluster::new(virtual_client.clone()));
    let physical_cluster = Arc::new(KubeCluster::new(physical_client));
    let index = Arc::new(RefIndex::new());
    let name_cache = Arc::new(NameCache::new());
    let locks = LockFactory::new();

    let proxy_state = Arc::new(
        ProxyState::build(
            &config,
            virtual_client,
            Arc::clone(&physical_cluster),
            translator.clone(),
            Arc::clone(&name_cache),
            &locks,
        )
        .await?,
    );

    let manager = Arc::new(SyncManager::new(
        config.clone(),
        translator,
        virtual_cluster,
        physical_cluster,
        index,
        name_cache,
        locks.get_lock("service-controller"),
    ));

    let token = CancellationToken::new();
    let manager_task = tokio::spawn(manager.run(token.clone()));
    let server_task = {
        let config = config.clone();
        let token = token.clone();
        tokio::spawn(async move { server::serve(&config, proxy_state, token).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    token.cancel();

    manager_task.await?.context("sync manager failed")?;
    server_task.await?.context("proxy server failed")?;

    tracing::info!("syncer stopped");
    Ok(())
}

async fn virtual_client(config: &SyncerConfig) -> anyhow::Result<kube::Client> {
    let kubeconfig = Kubeconfig::read_from(&config.virtual_kubeconfig)
        .with_context(|| format!("read {}", config.virtual_kubeconfig.display()))?;
    let client_config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("load virtual kubeconfig")?;
    kube::Client::try_from(client_config).context("create virtual client")
}
