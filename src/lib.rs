//! vidshelf: media catalog with stable identities, filesystem reconciliation
//! and acquisition jobs.
//!
//! This crate wires the vs-* libraries into a running service:
//!
//! - opens the SQLite state and loads the catalog
//! - reconciles every storage root once at startup
//! - recovers jobs a previous process left behind
//! - spawns the change watcher, the periodic rescan loop and the event log
//! - shuts everything down on SIGINT/SIGTERM

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vs_core::config::Config;
use vs_core::events::{Event, EventBus};
use vs_core::{Error, Result};
use vs_db::pool::{init_pool, DbPool};
use vs_jobs::{FetcherRegistry, JobOrchestrator};
use vs_library::{run_periodic_rescan, run_watcher, Library, RescanSummary};

pub use vs_core;
pub use vs_db;
pub use vs_jobs;
pub use vs_library;

/// A running vidshelf instance.
pub struct Service {
    pub config: Arc<Config>,
    pub db: DbPool,
    pub events: Arc<EventBus>,
    pub library: Arc<Library>,
    pub jobs: JobOrchestrator,
    /// Result of the startup reconcile.
    pub initial_scan: RescanSummary,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Open (creating if needed) the database named in the config.
pub fn open_db(config: &Config) -> Result<DbPool> {
    let db_path = &config.state.db_path;
    let existed = db_path.exists();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created database directory {}", parent.display());
        }
    }
    let db_str = db_path.to_string_lossy();
    let db = init_pool(&db_str)?;
    if existed {
        tracing::info!("Database opened (existing) at {db_str}");
    } else {
        tracing::info!("Database created (new) at {db_str}");
    }
    Ok(db)
}

impl Service {
    /// Start with the database and fetchers described by `config`.
    pub async fn start(config: Config) -> Result<Self> {
        let db = open_db(&config)?;
        let fetchers = FetcherRegistry::from_config(&config.fetchers)?;
        Self::start_with(config, db, fetchers).await
    }

    /// Start over an already-open database and an explicit set of fetchers.
    pub async fn start_with(config: Config, db: DbPool, fetchers: FetcherRegistry) -> Result<Self> {
        for warning in config.validate() {
            tracing::warn!("Config warning: {warning}");
        }

        let events = Arc::new(EventBus::default());
        let library = Arc::new(Library::open(&config, db.clone(), events.clone())?);
        tracing::info!(kinds = ?fetchers.kinds(), "Fetchers registered");

        let initial_scan = library.rescan_all().await;
        for failure in &initial_scan.failed {
            tracing::warn!(
                source_id = %failure.source_id,
                error = %failure.message,
                "Storage source could not be scanned at startup"
            );
        }

        let jobs = JobOrchestrator::new(db.clone(), library.clone(), fetchers, config.jobs.clone());
        jobs.recover()?;

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let log_rx = events.subscribe();
        let log_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            log_events(log_rx, log_cancel).await;
        }));

        let watcher_library = library.clone();
        let watcher_config = config.watch.clone();
        let watcher_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_watcher(watcher_library, watcher_config, watcher_cancel).await;
        }));

        let rescan_library = library.clone();
        let rescan_every = Duration::from_secs(config.library.scan_interval_secs);
        let rescan_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            run_periodic_rescan(rescan_library, rescan_every, rescan_cancel).await;
        }));

        tracing::info!(
            sources = library.sources().len(),
            entries = library.catalog().len(),
            "vidshelf started"
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            events,
            library,
            jobs,
            initial_scan,
            cancel,
            tasks,
        })
    }

    /// Token that stops the service when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until SIGINT, SIGTERM or [`Service::cancel_token`] fires, then
    /// shut down.
    pub async fn run_until_shutdown(self) -> Result<()> {
        shutdown_signal(self.cancel.clone()).await?;
        self.shutdown().await;
        Ok(())
    }

    /// Stop background tasks and give running jobs their grace period.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down...");
        self.cancel.cancel();
        self.jobs.shutdown().await;
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Shutdown complete");
    }
}

/// Mirror every bus event into the log as JSON at debug level.
async fn log_events(mut rx: broadcast::Receiver<Event>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(data) => tracing::debug!(target: "vidshelf::events", "{data}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Event log lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
async fn shutdown_signal(cancel: CancellationToken) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|e| Error::Internal(format!("failed to install SIGTERM handler: {e}")))?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.map_err(|e| Error::Internal(format!("failed to listen for Ctrl+C: {e}")))?;
        }
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
    Ok(())
}
