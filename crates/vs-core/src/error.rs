//! Unified error type for vidshelf.
//!
//! All crates funnel their failures into [`Error`]. [`Error::kind`] gives API
//! consumers a stable tag to branch on without matching the enum.

use std::fmt;

/// Unified error type covering all failure modes in vidshelf.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "media entry", "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The target location is already occupied.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The requested transition is not legal from the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Request data failed validation (bad relative path, unknown kind, ...).
    #[error("Validation error: {0}")]
    Validation(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A storage root could not be read (missing, permission denied).
    #[error("Source {source_id} unavailable: {message}")]
    SourceIo {
        /// The storage source whose root failed.
        source_id: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external source failed while fetching content.
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// An external tool (ffmpeg, a downloader) failed.
    #[error("Tool error ({tool}): {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable, machine-readable tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Conflict(_) => "conflict",
            Error::InvalidState(_) => "invalid_state",
            Error::Validation(_) => "validation",
            Error::Io { .. } | Error::SourceIo { .. } => "io",
            Error::Fetch(_) => "fetch",
            Error::Tool { .. } => "tool",
            Error::Database { .. } => "database",
            Error::Internal(_) => "internal",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::SourceIo`].
    pub fn source_io(source_id: impl fmt::Display, message: impl fmt::Display) -> Self {
        Error::SourceIo {
            source_id: source_id.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
