//! vs-db: database access and persistence layer.
//!
//! SQLite-backed storage with connection pooling, embedded migrations, row
//! mapping for the vs-core domain records, and query modules for identities,
//! catalog entries, watch progress and jobs.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
