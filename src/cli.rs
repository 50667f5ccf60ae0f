use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vidshelf")]
#[command(author, version, about = "Media catalog with filesystem reconciliation and acquisition jobs")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the service: watcher, periodic rescans and job workers
    Run,

    /// Rescan storage roots once and print what changed
    Scan {
        /// Only rescan this storage source
        #[arg(long)]
        source: Option<String>,
    },

    /// List catalogued media
    List {
        /// Only list entries of this storage source
        #[arg(long)]
        source: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search entries by title or path
    Search {
        /// Case-insensitive substring to look for
        #[arg(required = true)]
        query: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List acquisition jobs
    Jobs {
        /// Only jobs of this kind
        #[arg(long)]
        kind: Option<String>,

        /// Only jobs in this status (queued, running, done, failed, stopped)
        #[arg(long)]
        status: Option<String>,
    },

    /// Run one acquisition job in the foreground
    Fetch {
        /// Fetcher kind (e.g. http)
        #[arg(long, default_value = "http")]
        kind: String,

        /// Storage source to place the result in
        #[arg(long)]
        source: String,

        /// Target path relative to the storage root
        #[arg(long)]
        target: String,

        /// Source URL, passed to the fetcher as the `url` parameter
        #[arg(long)]
        url: Option<String>,

        /// Extra fetcher parameter as key=value (repeatable)
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },

    /// Create a browser-playable copy of a media entry
    Convert {
        /// Media entry id
        #[arg(required = true)]
        media_id: String,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
