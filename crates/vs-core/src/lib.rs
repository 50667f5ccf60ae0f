//! vs-core: shared types, IDs, errors, configuration and the event bus.
//!
//! Every other vs-* crate depends on this one. It carries no I/O beyond
//! reading the config file and normalizing paths.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod models;
pub mod paths;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use models::*;
