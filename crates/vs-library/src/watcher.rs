//! Change watcher.
//!
//! One recursive `notify` subscription per storage root feeds a bounded
//! channel. [`WatchStream`] turns the raw notifications into
//! [`ChangeEvent`]s, or into [`WatchSignal::Degraded`] when the platform
//! dropped events or a root went away. [`run_watcher`] drives the stream
//! into the [`Library`], flushes settled paths and re-subscribes after a
//! degradation, rescanning the affected roots to catch up.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vs_core::config::WatchConfig;
use vs_core::events::EventPayload;
use vs_core::paths::rel_path_of;
use vs_core::{SourceId, StorageSource};

use crate::change::ChangeEvent;
use crate::indexer::Library;

/// What the watcher has to say about a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Change(ChangeEvent),
    /// Notifications for this root can no longer be trusted.
    Degraded { source_id: SourceId, reason: String },
}

type RawEvent = (usize, notify::Result<notify::Event>);

struct WatchedRoot {
    source_id: SourceId,
    root: PathBuf,
    overflowed: Arc<AtomicBool>,
    _watcher: RecommendedWatcher,
}

/// Normalized change signals for a set of storage roots.
///
/// The stream ends once every subscription is gone; callers re-subscribe.
pub struct WatchStream {
    roots: Vec<WatchedRoot>,
    rx: mpsc::Receiver<RawEvent>,
    buffered: VecDeque<WatchSignal>,
    config: WatchConfig,
}

impl WatchStream {
    /// Subscribe to every root. Roots that cannot be watched are reported
    /// as degraded on the first calls to [`WatchStream::next`].
    pub fn subscribe(sources: &[StorageSource], config: &WatchConfig) -> Self {
        let (tx, rx) = mpsc::channel::<RawEvent>(config.channel_capacity.max(1));
        let mut roots = Vec::with_capacity(sources.len());
        let mut buffered = VecDeque::new();

        for source in sources {
            let index = roots.len();
            let overflowed = Arc::new(AtomicBool::new(false));
            let flag = overflowed.clone();
            let tx = tx.clone();

            let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if tx.try_send((index, res)).is_err() {
                    flag.store(true, Ordering::Relaxed);
                }
            });

            let mut watcher = match watcher {
                Ok(w) => w,
                Err(e) => {
                    buffered.push_back(degraded(&source.id, format!("failed to create watcher: {e}")));
                    continue;
                }
            };
            if let Err(e) = watcher.watch(&source.root_path, RecursiveMode::Recursive) {
                buffered.push_back(degraded(
                    &source.id,
                    format!("failed to watch {}: {e}", source.root_path.display()),
                ));
                continue;
            }

            tracing::info!(
                source_id = %source.id,
                root = %source.root_path.display(),
                "Watching storage root"
            );
            roots.push(WatchedRoot {
                source_id: source.id.clone(),
                root: source.root_path.clone(),
                overflowed,
                _watcher: watcher,
            });
        }

        Self {
            roots,
            rx,
            buffered,
            config: config.clone(),
        }
    }

    /// Number of roots with a live subscription.
    pub fn watched(&self) -> usize {
        self.roots.len()
    }

    /// Wait for the next signal. `None` means no subscription is left.
    pub async fn next(&mut self) -> Option<WatchSignal> {
        loop {
            self.check_overflow();
            if let Some(signal) = self.buffered.pop_front() {
                return Some(signal);
            }

            let (index, res) = self.rx.recv().await?;
            let Some(root) = self.roots.get(index) else {
                continue;
            };
            match res {
                Ok(event) => self.buffered.extend(normalize_event(
                    &root.source_id,
                    &root.root,
                    event,
                    &self.config,
                )),
                Err(e) => self
                    .buffered
                    .push_back(degraded(&root.source_id, format!("watch error: {e}"))),
            }
        }
    }

    fn check_overflow(&mut self) {
        for root in &self.roots {
            if root.overflowed.swap(false, Ordering::Relaxed) {
                self.buffered
                    .push_back(degraded(&root.source_id, "notification channel overflowed"));
            }
        }
    }
}

fn degraded(source_id: &SourceId, reason: impl Into<String>) -> WatchSignal {
    WatchSignal::Degraded {
        source_id: source_id.clone(),
        reason: reason.into(),
    }
}

/// Translate one native notification into change signals for `source_id`.
pub fn normalize_event(
    source_id: &SourceId,
    root: &Path,
    event: notify::Event,
    config: &WatchConfig,
) -> Vec<WatchSignal> {
    if event.need_rescan() {
        return vec![degraded(source_id, "platform dropped notifications")];
    }

    let is_root = |p: &PathBuf| p.as_path() == root;
    if matches!(event.kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)))
        && event.paths.iter().any(is_root)
    {
        return vec![degraded(source_id, "storage root removed or renamed")];
    }

    let rel = |p: &PathBuf| rel_path_of(root, p);
    let ignored = |rel: &str| config.is_ignored(rel.rsplit('/').next().unwrap_or(rel));
    let single = |make: fn(SourceId, String) -> ChangeEvent| -> Vec<WatchSignal> {
        event
            .paths
            .iter()
            .filter_map(rel)
            .filter(|r| !ignored(r))
            .map(|r| WatchSignal::Change(make(source_id.clone(), r)))
            .collect()
    };

    match event.kind {
        EventKind::Create(_) => single(|s, r| ChangeEvent::created(s, r)),
        EventKind::Remove(_) => single(|s, r| ChangeEvent::removed(s, r)),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let from = rel(&event.paths[0]).filter(|r| !ignored(r));
            let to = rel(&event.paths[1]).filter(|r| !ignored(r));
            match (from, to) {
                (Some(from), Some(to)) => vec![WatchSignal::Change(ChangeEvent::renamed(
                    source_id.clone(),
                    from,
                    to,
                ))],
                // A finished download renamed from its partial name, or a
                // file moved in from outside the root.
                (None, Some(to)) => vec![WatchSignal::Change(ChangeEvent::created(
                    source_id.clone(),
                    to,
                ))],
                (Some(from), None) => vec![WatchSignal::Change(ChangeEvent::removed(
                    source_id.clone(),
                    from,
                ))],
                (None, None) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            single(|s, r| ChangeEvent::removed(s, r))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            single(|s, r| ChangeEvent::created(s, r))
        }
        EventKind::Modify(_) | EventKind::Any => single(|s, r| ChangeEvent::modified(s, r)),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

async fn next_signal(stream: &mut Option<WatchStream>) -> Option<WatchSignal> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Feed filesystem changes into the library until cancelled.
pub async fn run_watcher(library: Arc<Library>, config: WatchConfig, cancel: CancellationToken) {
    if !config.enabled {
        tracing::info!("Change watcher disabled");
        return;
    }

    let tick_every = (config.debounce() / 4).max(Duration::from_millis(100));
    let resubscribe_delay = Duration::from_secs(config.resubscribe_delay_secs);
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sources_rx = library.subscribe_sources();

    let mut stream = Some(WatchStream::subscribe(&library.sources(), &config));
    let mut degraded_sources: BTreeSet<SourceId> = BTreeSet::new();
    let mut resubscribe_at: Option<Instant> = None;
    let mut flushing: Option<JoinHandle<usize>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = next_signal(&mut stream) => match signal {
                Some(WatchSignal::Change(event)) if event.is_paired_rename() => {
                    // Takes the source lock; keep draining meanwhile.
                    let library = library.clone();
                    tokio::spawn(async move {
                        if let Err(e) = library.handle_change(event).await {
                            tracing::warn!(error = %e, "Failed to handle change");
                        }
                    });
                }
                Some(WatchSignal::Change(event)) => library.enqueue(event),
                Some(WatchSignal::Degraded { source_id, reason }) => {
                    tracing::warn!(source_id = %source_id, reason = %reason, "Watcher degraded; will rescan");
                    library.event_bus().broadcast(EventPayload::WatcherDegraded {
                        source_id: source_id.clone(),
                        reason,
                    });
                    degraded_sources.insert(source_id);
                    resubscribe_at.get_or_insert_with(|| Instant::now() + resubscribe_delay);
                }
                None => {
                    tracing::warn!("All watch subscriptions ended");
                    stream = None;
                    degraded_sources.extend(library.sources().into_iter().map(|s| s.id));
                    resubscribe_at.get_or_insert_with(|| Instant::now() + resubscribe_delay);
                }
            },
            _ = ticker.tick() => {
                // At most one flush in flight; a held source only delays itself.
                if flushing.as_ref().map_or(true, |h| h.is_finished()) {
                    let library = library.clone();
                    flushing = Some(tokio::spawn(async move {
                        library.flush_settled(Instant::now()).await
                    }));
                }

                if resubscribe_at.is_some_and(|at| Instant::now() >= at) {
                    resubscribe_at = None;
                    stream = Some(WatchStream::subscribe(&library.sources(), &config));
                    for source_id in std::mem::take(&mut degraded_sources) {
                        let library = library.clone();
                        tokio::spawn(async move {
                            if let Err(e) = library.rescan_source(&source_id).await {
                                tracing::warn!(source_id = %source_id, error = %e, "Catch-up rescan failed");
                            }
                        });
                    }
                }
            },
            changed = sources_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                tracing::info!("Storage sources changed; re-subscribing");
                stream = Some(WatchStream::subscribe(&library.sources(), &config));
            },
        }
    }

    tracing::info!("Change watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeKind;
    use notify::event::{CreateKind, DataChange, Flag, RemoveKind};

    fn src() -> SourceId {
        SourceId::from("movies")
    }

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        paths
            .iter()
            .fold(notify::Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    fn changes(signals: Vec<WatchSignal>) -> Vec<ChangeEvent> {
        signals
            .into_iter()
            .filter_map(|s| match s {
                WatchSignal::Change(c) => Some(c),
                WatchSignal::Degraded { .. } => None,
            })
            .collect()
    }

    fn normalize(kind: EventKind, paths: &[&str]) -> Vec<WatchSignal> {
        normalize_event(
            &src(),
            Path::new("/media/movies"),
            event(kind, paths),
            &WatchConfig::default(),
        )
    }

    #[test]
    fn create_and_remove_map_directly() {
        let created = changes(normalize(
            EventKind::Create(CreateKind::File),
            &["/media/movies/a/b.mp4"],
        ));
        assert_eq!(created, vec![ChangeEvent::created(src(), "a/b.mp4")]);

        let removed = changes(normalize(
            EventKind::Remove(RemoveKind::File),
            &["/media/movies/x.mkv"],
        ));
        assert_eq!(removed, vec![ChangeEvent::removed(src(), "x.mkv")]);
    }

    #[test]
    fn data_change_is_modified() {
        let out = changes(normalize(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/media/movies/x.mkv"],
        ));
        assert_eq!(out[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn paired_rename_is_renamed() {
        let out = changes(normalize(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/media/movies/old.mp4", "/media/movies/new/new.mp4"],
        ));
        assert_eq!(out, vec![ChangeEvent::renamed(src(), "old.mp4", "new/new.mp4")]);
    }

    #[test]
    fn rename_from_partial_is_created() {
        let out = changes(normalize(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/media/movies/dl.mp4.part", "/media/movies/dl.mp4"],
        ));
        assert_eq!(out, vec![ChangeEvent::created(src(), "dl.mp4")]);
    }

    #[test]
    fn half_renames_are_remove_and_create() {
        let from = changes(normalize(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/media/movies/a.mp4"],
        ));
        assert_eq!(from[0].kind, ChangeKind::Removed);
        let to = changes(normalize(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/media/movies/b.mp4"],
        ));
        assert_eq!(to[0].kind, ChangeKind::Created);
    }

    #[test]
    fn ignored_suffixes_and_outside_paths_are_dropped() {
        assert!(normalize(
            EventKind::Create(CreateKind::File),
            &["/media/movies/x.mp4.part"],
        )
        .is_empty());
        assert!(normalize(EventKind::Create(CreateKind::File), &["/elsewhere/x.mp4"]).is_empty());
        assert!(normalize(
            EventKind::Access(notify::event::AccessKind::Any),
            &["/media/movies/x.mp4"],
        )
        .is_empty());
    }

    #[test]
    fn rescan_flag_and_root_removal_degrade() {
        let flagged = normalize_event(
            &src(),
            Path::new("/media/movies"),
            notify::Event::new(EventKind::Other).set_flag(Flag::Rescan),
            &WatchConfig::default(),
        );
        assert!(matches!(flagged[0], WatchSignal::Degraded { .. }));

        let root_gone = normalize(EventKind::Remove(RemoveKind::Folder), &["/media/movies"]);
        assert!(matches!(root_gone[0], WatchSignal::Degraded { .. }));
    }

    #[tokio::test]
    async fn missing_root_is_reported_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let source = StorageSource {
            id: src(),
            label: String::new(),
            root_path: dir.path().join("missing"),
        };
        let mut stream = WatchStream::subscribe(&[source], &WatchConfig::default());
        assert_eq!(stream.watched(), 0);
        let signal = stream.next().await.unwrap();
        assert!(matches!(signal, WatchSignal::Degraded { .. }));
        // Nothing left to watch.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn live_subscription_reports_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = StorageSource {
            id: src(),
            label: String::new(),
            root_path: dir.path().to_path_buf(),
        };
        let mut stream = WatchStream::subscribe(&[source], &WatchConfig::default());
        std::fs::write(dir.path().join("new.mp4"), b"x").unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(signal) = stream.next().await {
                if let WatchSignal::Change(change) = signal {
                    if change.rel_path == "new.mp4" {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(found);
    }
}
