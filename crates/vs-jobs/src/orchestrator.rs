//! Job orchestrator.
//!
//! Persists acquisition jobs, runs each one through the fetcher for its
//! kind and hands finished output to the library. Every state change goes
//! through a conditional update in the `jobs` table while holding the job's
//! own mutex, so transitions for one job are serialized and a worker from an
//! older attempt can never overwrite a newer one.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use vs_core::config::JobsConfig;
use vs_core::events::{EventBus, EventPayload};
use vs_core::paths::{normalize_rel_path, resolve_under};
use vs_core::{Error, Job, JobId, JobStatus, MediaId, NewJob, Result};
use vs_db::pool::{get_conn, DbPool};
use vs_db::queries::jobs;
use vs_library::Library;

use crate::fetcher::{FetchOutcome, FetchRequest, Fetcher, FetcherRegistry, ProgressSender};

/// Most jobs returned by [`JobOrchestrator::list_jobs`].
pub const LIST_LIMIT: u32 = 100;

const INTERRUPTED_REASON: &str = "interrupted: process restarted before the job finished";
const SHUTDOWN_REASON: &str = "interrupted: service shut down";

/// Jobs touched by [`JobOrchestrator::recover`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoverySummary {
    pub failed: Vec<JobId>,
    pub requeued: Vec<JobId>,
}

#[derive(Clone)]
struct RunningJob {
    attempt: u32,
    cancel: CancellationToken,
    /// Cancelled when the worker exits.
    finished: CancellationToken,
}

/// Removes the worker's registration however it exits.
struct RunGuard<'a> {
    running: &'a DashMap<JobId, RunningJob>,
    id: JobId,
    attempt: u32,
    finished: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .remove_if(&self.id, |_, r| r.attempt == self.attempt);
        self.finished.cancel();
    }
}

/// Latest progress of one attempt and when it was last persisted.
#[derive(Default)]
struct ProgressGate {
    pending: Option<(f64, Option<String>)>,
    last_write: Option<Instant>,
}

impl ProgressGate {
    fn write(&mut self, db: &DbPool, events: &EventBus, id: JobId, attempt: u32) {
        let Some((progress, phase)) = self.pending.take() else {
            return;
        };
        self.last_write = Some(Instant::now());
        let written = get_conn(db)
            .and_then(|conn| jobs::update_progress(&conn, id, attempt, progress, phase.as_deref()));
        match written {
            Ok(true) => events.broadcast(EventPayload::JobProgress {
                job_id: id,
                progress,
                phase,
            }),
            Ok(false) => {}
            Err(e) => tracing::warn!(job_id = %id, error = %e, "Failed to persist job progress"),
        }
    }
}

struct Inner {
    db: DbPool,
    library: Arc<Library>,
    events: Arc<EventBus>,
    fetchers: FetcherRegistry,
    config: JobsConfig,
    slots: DashMap<String, Arc<Semaphore>>,
    job_locks: DashMap<JobId, Arc<tokio::sync::Mutex<()>>>,
    running: DashMap<JobId, RunningJob>,
    shutdown: CancellationToken,
}

/// Runs acquisition jobs. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        db: DbPool,
        library: Arc<Library>,
        fetchers: FetcherRegistry,
        config: JobsConfig,
    ) -> Self {
        let events = library.event_bus().clone();
        Self {
            inner: Arc::new(Inner {
                db,
                library,
                events,
                fetchers,
                config,
                slots: DashMap::new(),
                job_locks: DashMap::new(),
                running: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Job kinds that have a fetcher.
    pub fn kinds(&self) -> Vec<String> {
        self.inner.fetchers.kinds()
    }

    /// Number of jobs with a live worker.
    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    // -- queries ------------------------------------------------------------

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        let conn = get_conn(&self.inner.db)?;
        jobs::get_job(&conn, id)?.ok_or_else(|| Error::not_found("job", id))
    }

    /// Newest activity first, at most [`LIST_LIMIT`] jobs.
    pub fn list_jobs(&self, kind: Option<&str>, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let conn = get_conn(&self.inner.db)?;
        jobs::list_jobs(&conn, kind, status, LIST_LIMIT)
    }

    // -- commands -----------------------------------------------------------

    /// Persist a new job and queue it.
    pub fn submit(&self, new: NewJob) -> Result<Job> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::InvalidState("job orchestrator is shut down".into()));
        }
        if self.inner.fetchers.get(&new.kind).is_none() {
            return Err(Error::Validation(format!(
                "no fetcher for job kind '{}'",
                new.kind
            )));
        }
        self.inner.library.source(&new.source_id)?;
        let new = NewJob {
            target_rel_path: normalize_rel_path(&new.target_rel_path)?,
            ..new
        };

        let conn = get_conn(&self.inner.db)?;
        let job = jobs::create_job(&conn, &new)?;
        drop(conn);

        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            source_id = %job.source_id,
            target = %job.target_rel_path,
            "Job queued"
        );
        self.inner.events.broadcast(EventPayload::JobQueued {
            job_id: job.id,
            kind: job.kind.clone(),
        });
        self.spawn_worker(job.id);
        Ok(job)
    }

    /// Stop a queued or running job.
    ///
    /// A running fetcher is cancelled and given the configured grace period
    /// to unwind. If it is still busy after that the job stays `stopped` and
    /// the worker is left to finish on its own.
    pub async fn stop(&self, id: JobId) -> Result<Job> {
        let running = {
            let _guard = self.lock_job(id).await;
            let conn = get_conn(&self.inner.db)?;
            let job = jobs::get_job(&conn, id)?.ok_or_else(|| Error::not_found("job", id))?;
            if !matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                return Err(Error::InvalidState(format!("job {id} is {}", job.status)));
            }
            jobs::stop_job(&conn, id)?;
            self.inner.running.get(&id).map(|r| r.value().clone())
        };

        tracing::info!(job_id = %id, "Job stopped");
        self.inner
            .events
            .broadcast(EventPayload::JobStopped { job_id: id });

        if let Some(run) = running {
            run.cancel.cancel();
            let grace = self.inner.config.stop_grace();
            if tokio::time::timeout(grace, run.finished.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(
                    job_id = %id,
                    attempt = run.attempt,
                    grace_secs = grace.as_secs(),
                    "Fetcher did not stop within the grace period; disowning it"
                );
            }
        }
        self.get_job(id)
    }

    /// Put a failed or stopped job back in the queue as a new attempt.
    pub async fn restart(&self, id: JobId) -> Result<Job> {
        let job = {
            let _guard = self.lock_job(id).await;
            let conn = get_conn(&self.inner.db)?;
            let job = jobs::get_job(&conn, id)?.ok_or_else(|| Error::not_found("job", id))?;
            match job.status {
                JobStatus::Done => {
                    return Err(Error::InvalidState(format!(
                        "job {id} is done and cannot be restarted"
                    )))
                }
                JobStatus::Queued | JobStatus::Running => {
                    return Err(Error::InvalidState(format!("job {id} is already {}", job.status)))
                }
                JobStatus::Failed | JobStatus::Stopped => {}
            }
            if self.inner.running.contains_key(&id) {
                return Err(Error::InvalidState(format!(
                    "job {id} is still shutting down its previous attempt"
                )));
            }
            jobs::requeue_job(&conn, id)?
                .ok_or_else(|| Error::InvalidState(format!("job {id} cannot be restarted")))?
        };

        tracing::info!(job_id = %id, attempt = job.attempt, "Job restarted");
        self.inner.events.broadcast(EventPayload::JobQueued {
            job_id: id,
            kind: job.kind.clone(),
        });
        self.spawn_worker(id);
        Ok(job)
    }

    /// Same as [`JobOrchestrator::restart`].
    pub async fn retry(&self, id: JobId) -> Result<Job> {
        self.restart(id).await
    }

    /// Delete a job record, stopping it first if it is active.
    pub async fn delete(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id)?;
        if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
            match self.stop(id).await {
                Ok(_) | Err(Error::InvalidState(_)) => {}
                Err(e) => return Err(e),
            }
        }

        {
            let _guard = self.lock_job(id).await;
            let conn = get_conn(&self.inner.db)?;
            if !jobs::delete_job(&conn, id)? {
                return Err(Error::not_found("job", id));
            }
        }
        self.inner.job_locks.remove(&id);

        tracing::info!(job_id = %id, "Job deleted");
        self.inner
            .events
            .broadcast(EventPayload::JobDeleted { job_id: id });
        Ok(())
    }

    /// Startup pass: fail jobs a previous process left running and queue
    /// workers for jobs it left queued.
    pub fn recover(&self) -> Result<RecoverySummary> {
        let conn = get_conn(&self.inner.db)?;
        let failed = jobs::fail_interrupted(&conn, INTERRUPTED_REASON)?;
        let requeued = jobs::queued_job_ids(&conn)?;
        drop(conn);

        for id in &failed {
            tracing::warn!(job_id = %id, "Job was interrupted by a restart");
            self.inner.events.broadcast(EventPayload::JobFailed {
                job_id: *id,
                error: INTERRUPTED_REASON.to_string(),
            });
        }
        for id in &requeued {
            self.spawn_worker(*id);
        }

        tracing::info!(
            failed = failed.len(),
            requeued = requeued.len(),
            "Job recovery complete"
        );
        Ok(RecoverySummary { failed, requeued })
    }

    /// Cancel every worker and wait up to the grace period for them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let finished: Vec<CancellationToken> = self
            .inner
            .running
            .iter()
            .map(|r| r.finished.clone())
            .collect();
        if finished.is_empty() {
            return;
        }

        let all = async {
            for token in &finished {
                token.cancelled().await;
            }
        };
        if tokio::time::timeout(self.inner.config.stop_grace(), all)
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.inner.running.len(),
                "Job workers still busy at shutdown; disowning them"
            );
        }
    }

    // -- workers ------------------------------------------------------------

    async fn lock_job(&self, id: JobId) -> OwnedMutexGuard<()> {
        let mutex = self.inner.job_locks.entry(id).or_default().clone();
        mutex.lock_owned().await
    }

    fn slots_for(&self, kind: &str) -> Arc<Semaphore> {
        self.inner
            .slots
            .entry(kind.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.inner.config.limit_for(kind))))
            .clone()
    }

    fn spawn_worker(&self, id: JobId) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run_worker(id).await {
                tracing::error!(job_id = %id, error = %e, "Job worker error");
            }
        });
    }

    async fn run_worker(&self, id: JobId) -> Result<()> {
        let job = self.get_job(id)?;
        if job.status != JobStatus::Queued {
            return Ok(());
        }

        let slots = self.slots_for(&job.kind);
        let _permit = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Ok(()),
            permit = slots.acquire_owned() => permit
                .map_err(|e| Error::Internal(format!("job slots closed: {e}")))?,
        };

        let (attempt, cancel, finished) = {
            let _guard = self.lock_job(id).await;
            let conn = get_conn(&self.inner.db)?;
            // Stopped, deleted or claimed by another worker while waiting.
            let Some(attempt) = jobs::mark_running(&conn, id)? else {
                return Ok(());
            };
            let run = RunningJob {
                attempt,
                cancel: self.inner.shutdown.child_token(),
                finished: CancellationToken::new(),
            };
            self.inner.running.insert(id, run.clone());
            (attempt, run.cancel, run.finished)
        };
        let _registration = RunGuard {
            running: &self.inner.running,
            id,
            attempt,
            finished,
        };

        tracing::info!(job_id = %id, kind = %job.kind, attempt, "Job started");
        self.inner
            .events
            .broadcast(EventPayload::JobStarted { job_id: id });

        let Some(fetcher) = self.inner.fetchers.get(&job.kind) else {
            let message = format!("no fetcher configured for job kind '{}'", job.kind);
            return self.finish_failed(id, attempt, &message).await;
        };
        let request = match self.request_for(&job) {
            Ok(request) => request,
            Err(e) => return self.finish_failed(id, attempt, &e.to_string()).await,
        };

        let gate = Arc::new(Mutex::new(ProgressGate::default()));
        let progress = self.progress_sender(id, attempt, gate.clone());

        let result = match fetcher.fetch(&request, &progress, cancel.clone()).await {
            Ok(outcome) => self.hand_off(&job, outcome).await,
            Err(e) => Err(e),
        };
        gate.lock()
            .write(&self.inner.db, &self.inner.events, id, attempt);

        match result {
            Ok(media_id) => self.finish_done(id, attempt, media_id).await,
            Err(_) if self.inner.shutdown.is_cancelled() => {
                self.finish_failed(id, attempt, SHUTDOWN_REASON).await
            }
            Err(e) if cancel.is_cancelled() => {
                tracing::debug!(job_id = %id, error = %e, "Fetcher unwound after stop");
                if let Err(e) = fetcher.cleanup(&request).await {
                    tracing::warn!(job_id = %id, error = %e, "Failed to clean up partial output");
                }
                Ok(())
            }
            Err(e) => self.finish_failed(id, attempt, &e.to_string()).await,
        }
    }

    fn request_for(&self, job: &Job) -> Result<FetchRequest> {
        let source = self.inner.library.source(&job.source_id)?;
        Ok(FetchRequest {
            job_id: job.id,
            kind: job.kind.clone(),
            source_id: job.source_id.clone(),
            target_rel_path: job.target_rel_path.clone(),
            target_path: resolve_under(&source.root_path, &job.target_rel_path),
            params: job.params.clone(),
        })
    }

    /// Progress callback that persists at most once per flush interval.
    fn progress_sender(
        &self,
        id: JobId,
        attempt: u32,
        gate: Arc<Mutex<ProgressGate>>,
    ) -> ProgressSender {
        let db = self.inner.db.clone();
        let events = self.inner.events.clone();
        let every = self.inner.config.progress_flush();
        ProgressSender::new(move |percent, phase| {
            if !percent.is_finite() {
                return;
            }
            let mut gate = gate.lock();
            gate.pending = Some((percent.clamp(0.0, 100.0), phase.map(str::to_string)));
            if gate.last_write.map_or(true, |t| t.elapsed() >= every) {
                gate.write(&db, &events, id, attempt);
            }
        })
    }

    /// Index the fetched output. The largest entry becomes the job result.
    async fn hand_off(&self, job: &Job, outcome: FetchOutcome) -> Result<Option<MediaId>> {
        if let Some(name) = &outcome.display_name {
            let conn = get_conn(&self.inner.db)?;
            jobs::set_display_name(&conn, job.id, name)?;
        }
        let entries = self
            .inner
            .library
            .ingest_path(&job.source_id, &outcome.output_path)
            .await?;
        if entries.is_empty() {
            tracing::warn!(
                job_id = %job.id,
                output = %outcome.output_path.display(),
                "Fetched output contains no media files"
            );
        }
        Ok(entries
            .into_iter()
            .max_by_key(|e| e.size_bytes)
            .map(|e| e.id))
    }

    async fn finish_done(&self, id: JobId, attempt: u32, media_id: Option<MediaId>) -> Result<()> {
        let _guard = self.lock_job(id).await;
        let conn = get_conn(&self.inner.db)?;
        if jobs::complete_job(&conn, id, attempt, media_id.as_ref())? {
            tracing::info!(job_id = %id, media_id = ?media_id, "Job completed");
            self.inner.events.broadcast(EventPayload::JobCompleted {
                job_id: id,
                media_id,
            });
        } else {
            tracing::debug!(job_id = %id, attempt, "Fetch finished after the job left running");
        }
        Ok(())
    }

    async fn finish_failed(&self, id: JobId, attempt: u32, message: &str) -> Result<()> {
        let _guard = self.lock_job(id).await;
        let conn = get_conn(&self.inner.db)?;
        if jobs::fail_job(&conn, id, attempt, message)? {
            tracing::warn!(job_id = %id, error = message, "Job failed");
            self.inner.events.broadcast(EventPayload::JobFailed {
                job_id: id,
                error: message.to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("fetchers", &self.inner.fetchers)
            .field("running", &self.inner.running.len())
            .finish_non_exhaustive()
    }
}
