//! dataClay Backend Daemon
//!
//! Runs one backend node: opens the metadata kv store, autoregisters in the
//! backend directory, starts the memory monitor and serves until a shutdown
//! signal arrives, at which point every loaded object is flushed to disk
//! and the backend deregisters.

use anyhow::{Context, Result};
use clap::Parser;
use dataclay_backend::{BackendRuntime, DiskStorage, SystemMemoryGauge};
use dataclay_common::{BackendConfig, BackendId, DataclayId, Error, MetadataConfig};
use dataclay_metadata::{KvStore, MemoryKv, MetadataService, RedbKv};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dataclayd")]
#[command(about = "dataClay Backend Daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/dataclay/backend.toml")]
    config: String,

    /// Host this backend is reachable at
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port this backend is reachable at
    #[arg(short, long, default_value = "6867")]
    port: u16,

    /// Override for the object storage directory
    #[arg(long)]
    storage_path: Option<String>,

    /// Path of the metadata kv database (omit for in-memory)
    #[arg(long)]
    kv_path: Option<String>,

    /// Superuser name to create on first startup
    #[arg(long, default_value = "admin")]
    superuser: String,

    /// Superuser password; no account is created when omitted
    #[arg(long)]
    superuser_password: Option<String>,

    /// Dataset owned by the superuser
    #[arg(long, default_value = "admin")]
    superuser_dataset: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dataClay backend daemon");

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::with_prefix("DATACLAY").separator("__"))
        .build()
        .context("cannot load configuration")?;
    let mut backend_config: BackendConfig = settings.get("backend").unwrap_or_default();
    let mut metadata_config: MetadataConfig = settings.get("metadata").unwrap_or_default();

    if let Some(path) = &args.storage_path {
        backend_config.storage_path = path.into();
    }
    if let Some(path) = &args.kv_path {
        metadata_config.kv_path = Some(path.into());
    }

    let kv: Arc<dyn KvStore> = match &metadata_config.kv_path {
        Some(path) => {
            info!(path = %path.display(), "opening kv store");
            Arc::new(RedbKv::open(path).context("cannot open kv store")?)
        }
        None => {
            info!("using in-memory kv store");
            Arc::new(MemoryKv::new())
        }
    };
    let ready_timeout = metadata_config.ready_timeout;
    let metadata = Arc::new(MetadataService::new(kv, metadata_config));
    if !metadata.is_ready(Some(ready_timeout)) {
        anyhow::bail!("metadata kv store did not become ready");
    }

    if let Some(password) = &args.superuser_password {
        match metadata
            .new_superuser(&args.superuser, password, &args.superuser_dataset)
            .await
        {
            Ok(()) => info!(username = %args.superuser, "superuser created"),
            Err(e) if e.is_conflict() => {
                info!(username = %args.superuser, "superuser already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let dataclay = match metadata.get_own_dataclay().await {
        Ok(dataclay) => dataclay,
        Err(Error::DoesNotExist(_)) => {
            let dataclay_id = DataclayId::new();
            metadata
                .new_dataclay(dataclay_id, &args.host, args.port, true)
                .await?;
            metadata.get_own_dataclay().await?
        }
        Err(e) => return Err(e.into()),
    };

    let storage = Arc::new(
        DiskStorage::open(&backend_config.storage_path).context("cannot open object storage")?,
    );
    let runtime = Arc::new(BackendRuntime::new(
        BackendId::new(),
        backend_config,
        metadata,
        storage,
        Arc::new(SystemMemoryGauge::new()),
    ));
    runtime.autoregister(&args.host, args.port, dataclay.id).await?;
    runtime.start();
    info!(backend_id = %runtime.backend_id(), host = %args.host, port = args.port,
        "backend ready");

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutdown signal received");
    runtime.stop().await?;
    info!("backend stopped");
    Ok(())
}
