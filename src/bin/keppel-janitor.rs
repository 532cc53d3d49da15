//! Janitor daemon binary: runs every periodic sweep against a Postgres
//! store until terminated.

use keppel::config::Config;
use keppel::federation::NoopFederation;
use keppel::janitor::account_reconcile::AccountReconcile;
use keppel::janitor::blob_sweep::BlobSweep;
use keppel::janitor::federation_announce::FederationAnnounce;
use keppel::janitor::manifest_gc::ManifestGc;
use keppel::janitor::manifest_sync::ManifestSync;
use keppel::janitor::mount_sweep::MountSweep;
use keppel::janitor::scheduler;
use keppel::janitor::storage_sweep::StorageSweep;
use keppel::janitor::validation_sweep::ValidationSweep;
use keppel::janitor::vuln_check::VulnCheck;
use keppel::janitor::Sweep;
use keppel::managed_account::NoopManagedAccounts;
use keppel::scanner::{HttpScanner, NoopScanner, ScannerClient};
use keppel::storage::fs::FsStorageDriver;
use keppel::storage::StorageDriver;
use keppel::store::pg::PgStore;
use keppel::store::Store;
use keppel::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    let pg = PgStore::connect(&config.database.url(), 10).await?;
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);
    let storage: Arc<dyn StorageDriver> = Arc::new(FsStorageDriver::new(config.storage_root.clone()));
    let scanner: Arc<dyn ScannerClient> = match &config.scanner_url {
        Some(url) => Arc::new(HttpScanner::new(url.clone(), config.scanner_preshared_key.clone())),
        None => Arc::new(NoopScanner),
    };
    let federation = Arc::new(NoopFederation);
    let managed_accounts = Arc::new(NoopManagedAccounts);

    let janitor = &config.janitor;
    let sweeps: Vec<Arc<dyn Sweep>> = vec![
        Arc::new(BlobSweep::new(store.clone(), storage.clone(), janitor.sweep_interval, janitor.reconciliation_grace)),
        Arc::new(MountSweep::new(store.clone(), janitor.sweep_interval, janitor.reconciliation_grace)),
        Arc::new(ManifestGc::new(store.clone(), storage.clone(), janitor.sweep_interval)),
        Arc::new(ManifestSync::new(store.clone(), storage.clone(), janitor.sweep_interval)),
        Arc::new(StorageSweep::new(store.clone(), storage.clone(), janitor.sweep_interval, janitor.reconciliation_grace)),
        Arc::new(VulnCheck::new(store.clone(), scanner, janitor.sweep_interval)),
        Arc::new(FederationAnnounce::new(store.clone(), federation, janitor.sweep_interval)),
        Arc::new(AccountReconcile::new(store.clone(), managed_accounts, janitor.reconciliation_grace)),
        Arc::new(ValidationSweep::new(store.clone(), storage.clone(), janitor.validation_age)),
    ];

    let cancel = CancellationToken::new();
    let handles = scheduler::spawn_all(sweeps, janitor.sweep_interval, janitor.jitter_fraction, &cancel);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining janitor sweeps");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
