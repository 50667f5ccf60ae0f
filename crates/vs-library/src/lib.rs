//! vs-library: the media catalog and everything that keeps it in sync with
//! the storage roots.
//!
//! - [`IdentityStore`] hands out stable ids per `(source, path)`.
//! - [`Catalog`] holds the known entries behind a reader-writer lock.
//! - [`Library`] reconciles both against the filesystem, either by full
//!   rescan or by applying debounced [`ChangeEvent`]s, and implements the
//!   library operations (move, delete, folders, browse, watch progress).
//! - [`watcher`] turns native notifications into change events.
//! - [`transcode`] is the boundary to the playback-conversion collaborator.

pub mod catalog;
pub mod change;
pub mod identity;
pub mod indexer;
pub mod operations;
pub mod settle;
pub mod transcode;
pub mod walk;
pub mod watcher;

pub use catalog::{Catalog, UpsertOutcome};
pub use change::{ChangeEvent, ChangeKind};
pub use identity::IdentityStore;
pub use indexer::{run_periodic_rescan, Library, RescanSummary, SourceFailure, SourceRescan};
pub use operations::{BrowseItem, LibraryItem};
pub use transcode::{can_play_directly, ConvertOutcome, FfmpegTranscoder, Transcoder};
pub use watcher::{run_watcher, WatchSignal, WatchStream};
