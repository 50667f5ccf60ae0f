//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON. Every section
//! defaults sensibly so a completely empty `{}` file is valid (it simply has
//! no storage sources).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::models::StorageSource;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub library: LibraryConfig,
    pub watch: WatchConfig,
    pub state: StateConfig,
    pub jobs: JobsConfig,
    pub fetchers: FetchersConfig,
    pub transcode: TranscodeConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.library.sources.is_empty() {
            warnings.push("library.sources is empty; nothing will be indexed".into());
        }

        let mut seen = HashSet::new();
        for (i, source) in self.library.sources.iter().enumerate() {
            if source.id.as_str().trim().is_empty() {
                warnings.push(format!("library.sources[{i}].id is empty"));
            }
            if !seen.insert(source.id.clone()) {
                warnings.push(format!(
                    "library.sources[{i}].id '{}' is duplicated",
                    source.id
                ));
            }
            if source.root_path.as_os_str().is_empty() {
                warnings.push(format!("library.sources[{i}].root_path is empty"));
            }
        }

        if self.library.extensions.is_empty() {
            warnings.push("library.extensions is empty; nothing will be indexed".into());
        }

        if self.library.scan_interval_secs == 0 {
            warnings.push("library.scan_interval_secs is 0; periodic rescans are disabled".into());
        }

        if self.jobs.default_concurrency == 0 {
            warnings.push("jobs.default_concurrency is 0; it will be treated as 1".into());
        }

        for (i, cmd) in self.fetchers.commands.iter().enumerate() {
            if cmd.kind.is_empty() {
                warnings.push(format!("fetchers.commands[{i}].kind is empty"));
            }
            if !cmd.args.iter().any(|a| a.contains("{output}")) {
                warnings.push(format!(
                    "fetchers.commands[{i}] has no {{output}} placeholder in args"
                ));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Storage roots and what counts as a media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub sources: Vec<StorageSource>,
    /// Lowercase extensions without the leading dot.
    pub extensions: Vec<String>,
    /// Interval of the backstop full rescan; 0 disables it.
    pub scan_interval_secs: u64,
}

impl LibraryConfig {
    /// Extensions normalized to lowercase without a leading dot.
    pub fn normalized_extensions(&self) -> HashSet<String> {
        self.extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }
}

fn default_extensions() -> Vec<String> {
    ["mp4", "mkv", "avi", "mov", "webm", "m3u8"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            extensions: default_extensions(),
            scan_interval_secs: 21_600,
        }
    }
}

/// File-system watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    /// How long a path must be quiet before its change is applied.
    pub debounce_millis: u64,
    /// Partial-download suffixes that never produce change events.
    pub ignore_suffixes: Vec<String>,
    /// Bound on buffered raw notifications before the watcher degrades.
    pub channel_capacity: usize,
    /// Delay before a failed subscription is re-established.
    pub resubscribe_delay_secs: u64,
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    /// Whether a file name carries one of the ignored suffixes.
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_millis: 3_000,
            ignore_suffixes: [".part", ".!qB", ".tmp", ".crdownload", ".aria2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            channel_capacity: 1024,
            resubscribe_delay_secs: 5,
        }
    }
}

/// Persistent state location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub db_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/vidshelf.db"),
        }
    }
}

/// Job orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Time a cancelled fetcher gets to unwind before it is disowned.
    pub stop_grace_secs: u64,
    /// Minimum spacing between persisted progress updates of one job.
    pub progress_flush_millis: u64,
    /// Concurrent jobs per kind unless overridden in `concurrency`.
    pub default_concurrency: usize,
    pub concurrency: HashMap<String, usize>,
}

impl JobsConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn progress_flush(&self) -> Duration {
        Duration::from_millis(self.progress_flush_millis)
    }

    /// Effective concurrency cap for a job kind (never below 1).
    pub fn limit_for(&self, kind: &str) -> usize {
        self.concurrency
            .get(kind)
            .copied()
            .unwrap_or(self.default_concurrency)
            .max(1)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: 10,
            progress_flush_millis: 1_000,
            default_concurrency: 2,
            concurrency: HashMap::new(),
        }
    }
}

/// Built-in fetcher settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchersConfig {
    pub http: HttpFetcherConfig,
    pub commands: Vec<CommandFetcherConfig>,
}

/// Direct HTTP download fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFetcherConfig {
    pub enabled: bool,
    pub user_agent: String,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_agent: format!("vidshelf/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// External downloader invoked as a child process (e.g. yt-dlp).
///
/// `args` may contain `{url}` and `{output}` placeholders; `{output}` is
/// replaced with a temporary path next to the final target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFetcherConfig {
    pub kind: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Transcoding collaborator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub ffmpeg_path: Option<PathBuf>,
}
