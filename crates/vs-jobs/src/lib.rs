//! vs-jobs: acquisition jobs.
//!
//! A job asks a [`Fetcher`] to place content at a path inside a storage
//! source. The [`JobOrchestrator`] persists every job, caps concurrency per
//! kind, relays coalesced progress and hands finished output to the library
//! so it shows up in the catalog.

pub mod fetcher;
pub mod fetchers;
pub mod orchestrator;

pub use fetcher::{FetchOutcome, FetchRequest, Fetcher, FetcherRegistry, ProgressSender};
pub use fetchers::{CommandFetcher, HttpFetcher};
pub use orchestrator::{JobOrchestrator, RecoverySummary};
