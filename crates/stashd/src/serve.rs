//! Server bootstrap: state, background sweepers, listener and shutdown.

use anyhow::{Context, Result};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use stash::{spawn_janitor, spawn_sweeper, AdmissionConfig, AdmissionController, BlobStore, ExpiryPolicy, StoreConfig};
use stashconf::StashConfig;

use crate::web::{self, AppState};

/// Everything `run` needs, resolved from config files and CLI flags.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub listen: String,
    pub base_url: String,
    pub store: StoreConfig,
    pub admission: AdmissionConfig,
    pub default_expiry: String,
    pub max_upload_bytes: usize,
    pub sweep_interval: Duration,
}

impl ServeConfig {
    pub fn from_config(config: &StashConfig) -> Self {
        let store = StoreConfig {
            id_length: config.store.id_length,
            strict_metadata: config.store.strict_metadata,
            orphan_grace: Duration::from_secs(config.store.orphan_grace_secs),
            ..StoreConfig::with_root(&config.paths.storage_dir)
        };

        let admission = AdmissionConfig {
            capacity: config.limits.capacity,
            refill_interval: Duration::from_secs(config.limits.refill_interval_secs),
            max_clients: config.limits.max_clients,
            idle_ttl: Duration::from_secs(config.limits.client_idle_secs),
        };

        Self {
            listen: config.bind.listen.clone(),
            base_url: config.public.base_url(),
            store,
            admission,
            default_expiry: config.expiry.default.clone(),
            max_upload_bytes: config.limits.max_upload_bytes,
            sweep_interval: Duration::from_secs(config.store.sweep_interval_secs.max(1)),
        }
    }

    /// Reject settings that would only fail later, per request.
    pub fn validate(&self) -> Result<()> {
        ExpiryPolicy::from_selector(&self.default_expiry, Utc::now())
            .with_context(|| format!("Invalid default expiry {:?}", self.default_expiry))?;

        anyhow::ensure!(
            (1..=stash::locator::MAX_ID_LENGTH).contains(&self.store.id_length),
            "id_length must be between 1 and {}",
            stash::locator::MAX_ID_LENGTH
        );
        anyhow::ensure!(self.admission.capacity > 0, "rate limit capacity must be at least 1");
        anyhow::ensure!(self.admission.max_clients > 0, "max_clients must be at least 1");
        Ok(())
    }

    pub fn app_state(&self) -> AppState {
        let store = Arc::new(BlobStore::new(self.store.clone()));
        let admission = Arc::new(AdmissionController::new(self.admission.clone()));

        AppState::new(store, admission, self.base_url.as_str())
            .with_default_expiry(self.default_expiry.as_str())
            .with_max_upload_bytes(self.max_upload_bytes)
    }
}

/// Run the server until SIGINT or SIGTERM.
pub async fn run(config: ServeConfig) -> Result<()> {
    config.validate()?;

    info!("stash starting");
    info!("   Storage: {}", config.store.root.display());
    info!("   Public URL: {}", config.base_url);

    tokio::fs::create_dir_all(config.store.root())
        .await
        .with_context(|| format!("Failed to create storage dir {}", config.store.root.display()))?;

    let state = config.app_state();
    let cancel = CancellationToken::new();

    let janitor = spawn_janitor(Arc::clone(&state.store), config.sweep_interval, cancel.clone());
    let sweeper = spawn_sweeper(Arc::clone(&state.admission), config.sweep_interval, cancel.clone());

    let app = web::router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;

    info!("stash ready on {}", config.listen);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("Server error")?;

    cancel.cancel();
    let _ = tokio::join!(janitor, sweeper);

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}
