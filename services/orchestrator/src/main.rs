//! vmfleetd
//!
//! Accepts lifecycle requests over HTTP and runs them as background tasks
//! that keep the fleet spec, the metadata cache and the hypervisor in step.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmfleet_orchestrator::{
    api,
    config::{Config, MetadataBackend},
    config_mgmt::AnsibleRunner,
    db::{Database, MemoryMetadataStore, MemoryNotificationStore, MetadataStore},
    fleet_spec::{FleetSpecStore, SpecDefaults},
    hypervisor::ProxmoxClient,
    lifecycle::{Components, Orchestrator},
    notifications::NotificationStore,
    provision::TerraformEngine,
    state::AppState,
    tasks::{TaskCleanupWorker, TaskCleanupWorkerConfig, TaskRegistry},
};

type Stores = (Arc<dyn MetadataStore>, Arc<dyn NotificationStore>);

async fn open_stores(config: &Config) -> Result<Stores> {
    match config.metadata_backend {
        MetadataBackend::Memory => {
            warn!("Using in-memory metadata store; records are lost on restart");
            Ok((
                Arc::new(MemoryMetadataStore::new()),
                Arc::new(MemoryNotificationStore::new()),
            ))
        }
        MetadataBackend::Postgres => {
            let db = match Database::connect(&config.database).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            Ok((
                Arc::new(db.metadata_store()),
                Arc::new(db.notification_store()),
            ))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to VMFLEET_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting vmfleetd");
    info!(
        listen_addr = %config.listen_addr,
        spec_path = %config.spec_path.display(),
        tf_dir = %config.terraform.working_dir.display(),
        "Configuration loaded"
    );

    let (metadata, notifications) = open_stores(&config).await?;

    let provisioner = TerraformEngine::new(config.terraform.clone());
    provisioner.warn_on_stale_lock();

    let hypervisor = ProxmoxClient::new(config.proxmox.clone())?;
    let roles = AnsibleRunner::new(config.ansible.clone());
    let tasks = Arc::new(TaskRegistry::new(config.tasks.clone()));

    let orchestrator = Orchestrator::new(
        Components {
            specs: Arc::new(FleetSpecStore::new(config.spec_path.clone(), SpecDefaults::default())),
            metadata,
            hypervisor: Arc::new(hypervisor),
            provisioner: Arc::new(provisioner),
            roles: Arc::new(roles),
            notifications,
            tasks: tasks.clone(),
        },
        config.lifecycle.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup_worker = TaskCleanupWorker::new(tasks, TaskCleanupWorkerConfig::default());
    let cleanup_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            cleanup_worker.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(orchestrator));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), cleanup_handle).await {
        warn!(error = %e, "Task cleanup worker did not shut down in time");
    }

    // In-flight workflows are dropped with the runtime; their child
    // processes are killed on drop.
    info!("vmfleetd shutdown complete");
    Ok(())
}
