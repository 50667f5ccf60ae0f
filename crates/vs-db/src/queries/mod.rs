//! Database query modules.

pub mod identities;
pub mod jobs;
pub mod media_entries;
pub mod watch_progress;
