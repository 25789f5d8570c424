//! Wires the registry, stores and push workers together.

use std::sync::Arc;

use tardis_credentials::{CertificateSigner, CredentialStore, SshAccessVerifier};
use tardis_push::{
    JobStore, ManagerConfig, MemoryCatalog, PushEvent, PushJobManager, SshSessionFactory,
};
use tardis_transfer::{ProviderRegistry, RegistryBuilder, ReplicaVerifier};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::requests::RequestSpool;

/// Runs the daemon until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let timeout = config.operation_timeout();
    let cancel = CancellationToken::new();

    // -- Locations --
    let registry = Arc::new(
        RegistryBuilder::new()
            .timeout(timeout)
            .build(&config.locations)?,
    );
    probe_locations(&registry).await;

    // -- Credentials --
    let credentials = Arc::new(CredentialStore::open(
        config.credential_store.clone(),
        Arc::new(SshAccessVerifier::new(timeout)),
    )?);
    for host in &config.hosts {
        credentials.upsert_host(host.clone()).await?;
    }
    let signer = config
        .signing
        .as_ref()
        .map(|s| CertificateSigner::new(&s.sign_url, s.authorize_url.as_deref(), timeout))
        .transpose()?
        .map(Arc::new);

    // -- Catalog --
    let catalog = match &config.catalog {
        Some(path) => MemoryCatalog::load(path)?,
        None => {
            tracing::warn!("no catalog configured, push requests will find no files");
            MemoryCatalog::default()
        }
    };

    // -- Push jobs --
    let manager = PushJobManager::new(
        JobStore::open(config.job_store.clone())?,
        Arc::new(catalog),
        credentials,
        Arc::clone(&registry),
        Arc::new(SshSessionFactory::new(timeout)),
        signer,
        ManagerConfig {
            workers: config.workers,
            sweep_interval: config.sweep_interval(),
        },
    );
    if let Some(events) = manager.take_events() {
        tokio::spawn(log_events(events));
    }
    let workers = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move { manager.run(cancel).await }
    });

    // -- Requests --
    let spool = RequestSpool::new(
        config.request_dir.clone(),
        manager.clone(),
        ReplicaVerifier::new(registry),
    )?;
    let requests = tokio::spawn(spool.run(config.request_poll_interval(), cancel.clone()));

    tracing::info!("transfer daemon ready");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    cancel.cancel();
    requests.await?;
    workers.await?;
    Ok(())
}

async fn probe_locations(registry: &ProviderRegistry) {
    let names: Vec<String> = registry.locations().map(|l| l.name.clone()).collect();
    for name in names {
        match registry.probe(&name).await {
            Ok(true) => tracing::info!(location = %name, "location reachable"),
            Ok(false) => tracing::warn!(location = %name, "location unreachable"),
            Err(e) => tracing::error!(location = %name, error = %e, "location probe failed"),
        }
    }
}

/// Push notifications go to the log.
async fn log_events(mut events: mpsc::Receiver<PushEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PushEvent::Progress {
                job_id,
                file_id,
                done,
                total,
            } => tracing::debug!(job = job_id, file = file_id, done, total, "push progress"),
            PushEvent::Completed {
                job_id,
                user,
                message,
                ..
            } => tracing::info!(job = job_id, %user, "{message}"),
            PushEvent::Failed {
                job_id,
                user,
                message,
                ..
            } => tracing::warn!(job = job_id, %user, "{message}"),
            PushEvent::Abandoned {
                job_id,
                user,
                done,
                total,
            } => tracing::warn!(job = job_id, %user, done, total, "push job abandoned"),
        }
    }
}
