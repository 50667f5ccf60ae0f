//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which starts a full [`Service`] over temporary
//! storage roots (`movies` and `shows`) and an in-memory DB, with a
//! [`GatedFetcher`] registered for kind `fetch` in place of real downloaders.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use vidshelf::vs_core::config::Config;
use vidshelf::vs_core::events::{Event, EventPayload};
use vidshelf::vs_core::{Error, Job, JobId, Result, SourceId, StorageSource};
use vidshelf::vs_db::pool::init_memory_pool;
use vidshelf::vs_jobs::{FetchOutcome, FetchRequest, Fetcher, FetcherRegistry, ProgressSender};
use vidshelf::vs_library::Library;
use vidshelf::Service;

/// Fetcher that reports 50% and then waits for [`GatedFetcher::release`]
/// before writing `video-bytes` to the target.
pub struct GatedFetcher {
    release: Notify,
    pub calls: AtomicUsize,
}

impl GatedFetcher {
    pub fn new() -> Self {
        Self {
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Let one waiting (or the next) fetch finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Fetcher for GatedFetcher {
    fn kind(&self) -> &str {
        "fetch"
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress.send(50.0, Some("downloading"));
        tokio::select! {
            _ = self.release.notified() => {}
            _ = cancel.cancelled() => return Err(Error::Fetch("cancelled".into())),
        }
        if let Some(parent) = request.target_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&request.target_path, b"video-bytes").await?;
        Ok(FetchOutcome::at(request.target_path.clone()))
    }
}

/// A running service over temp roots.
pub struct TestHarness {
    pub service: Service,
    pub fetcher: Arc<GatedFetcher>,
    events: Mutex<(broadcast::Receiver<Event>, Vec<Event>)>,
    dir: tempfile::TempDir,
}

impl TestHarness {
    /// Two healthy sources, watcher and periodic rescans off.
    pub async fn new() -> Self {
        Self::with_config(|_, _| {}).await
    }

    /// Like [`TestHarness::new`], letting the caller adjust the config
    /// (roots already filled in) before the service starts.
    pub async fn with_config(tune: impl FnOnce(&mut Config, &Path)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = Config::default();
        config.library.sources = ["movies", "shows"]
            .into_iter()
            .map(|id| StorageSource {
                id: SourceId::from(id),
                label: String::new(),
                root_path: dir.path().join(id),
            })
            .collect();
        config.library.scan_interval_secs = 0;
        config.watch.enabled = false;
        config.jobs.progress_flush_millis = 0;
        config.jobs.stop_grace_secs = 1;
        tune(&mut config, dir.path());

        Self::start_in(dir, config).await
    }

    async fn start_in(dir: tempfile::TempDir, config: Config) -> Self {
        let fetcher = Arc::new(GatedFetcher::new());
        let mut fetchers = FetcherRegistry::new();
        fetchers.register(fetcher.clone());

        let db = init_memory_pool().expect("failed to create in-memory pool");
        let service = Service::start_with(config, db, fetchers)
            .await
            .expect("service failed to start");
        let events = Mutex::new((service.events.subscribe(), Vec::new()));
        Self {
            service,
            fetcher,
            events,
            dir,
        }
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.service.library
    }

    pub fn root(&self, source: &str) -> PathBuf {
        self.dir.path().join(source)
    }

    pub fn temp_path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file under a source root, creating parent directories.
    pub fn write(&self, source: &str, rel_path: &str, contents: &[u8]) -> PathBuf {
        let path = self.root(source).join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dir");
        }
        std::fs::write(&path, contents).expect("failed to write file");
        path
    }

    /// Sorted `(source, rel_path)` of every catalog entry.
    pub fn catalog_paths(&self) -> Vec<(String, String)> {
        let mut paths: Vec<_> = self
            .library()
            .catalog()
            .list(None)
            .into_iter()
            .map(|e| (e.source_id.to_string(), e.rel_path))
            .collect();
        paths.sort();
        paths
    }

    /// Every event broadcast since the service finished starting, oldest
    /// first.
    pub fn events_seen(&self) -> Vec<Event> {
        let mut guard = self.events.lock().unwrap();
        let (rx, seen) = &mut *guard;
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen.clone()
    }

    /// Number of `EntryAdded` and `EntryUpdated` events seen so far.
    pub fn upsert_events(&self) -> usize {
        self.events_seen()
            .into_iter()
            .filter(|e| {
                matches!(
                    e.payload,
                    EventPayload::EntryAdded { .. } | EventPayload::EntryUpdated { .. }
                )
            })
            .count()
    }

    /// Poll a job until `pred` holds; panics after five seconds.
    pub async fn wait_for_job(&self, id: JobId, pred: impl Fn(&Job) -> bool) -> Job {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.service.jobs.get_job(id).expect("job lookup failed");
            if pred(&job) {
                return job;
            }
            assert!(Instant::now() < deadline, "timed out waiting on job: {job:?}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
