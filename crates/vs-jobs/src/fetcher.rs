//! The fetcher capability and the registry that dispatches on job kind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vs_core::config::FetchersConfig;
use vs_core::{Error, JobId, Result, SourceId};

use crate::fetchers::{CommandFetcher, HttpFetcher};

/// Sender for reporting progress from within a fetcher.
///
/// Wraps a callback that receives a percentage (0.0 -- 100.0) and an
/// optional human-readable phase.
pub struct ProgressSender {
    callback: Box<dyn Fn(f64, Option<&str>) + Send + Sync>,
}

impl ProgressSender {
    pub fn new(callback: impl Fn(f64, Option<&str>) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A sender that discards all progress reports.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_, _| {}),
        }
    }

    pub fn send(&self, percent: f64, phase: Option<&str>) {
        (self.callback)(percent, phase);
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

/// Everything a fetcher needs to run one attempt of a job.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: JobId,
    pub kind: String,
    pub source_id: SourceId,
    pub target_rel_path: String,
    /// Absolute final location. Partial data must never be written here.
    pub target_path: PathBuf,
    pub params: serde_json::Value,
}

impl FetchRequest {
    /// A string parameter, or a validation error naming it.
    pub fn param_str(&self, name: &str) -> Result<&str> {
        self.params
            .get(name)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::Validation(format!("job parameter '{name}' is required")))
    }

    /// Sibling of the target used while data is still arriving.
    pub fn staging_path(&self) -> PathBuf {
        let mut name = self.target_path.clone().into_os_string();
        name.push(".part");
        PathBuf::from(name)
    }
}

/// What a successful fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// File or directory under the job's storage root.
    pub output_path: PathBuf,
    /// Better name for the job learned while fetching (e.g. a torrent name).
    pub display_name: Option<String>,
}

impl FetchOutcome {
    pub fn at(output_path: PathBuf) -> Self {
        Self {
            output_path,
            display_name: None,
        }
    }
}

/// Acquires content from an external source into a target path.
///
/// Implementations must honour `cancel` promptly and must only place data at
/// [`FetchRequest::target_path`] once it is complete.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Job kind this fetcher serves.
    fn kind(&self) -> &str;

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome>;

    /// Remove partial output after a stop. Best-effort.
    async fn cleanup(&self, request: &FetchRequest) -> Result<()> {
        match tokio::fs::remove_file(request.staging_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fetchers keyed by the job kind they serve.
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the fetchers described in the configuration.
    pub fn from_config(config: &FetchersConfig) -> Result<Self> {
        let mut registry = Self::new();
        if config.http.enabled {
            registry.register(Arc::new(HttpFetcher::new(&config.http.user_agent)?));
        }
        for command in &config.commands {
            registry.register(Arc::new(CommandFetcher::new(command.clone())));
        }
        Ok(registry)
    }

    /// Add a fetcher, replacing any previous one for the same kind.
    pub fn register(&mut self, fetcher: Arc<dyn Fetcher>) {
        let kind = fetcher.kind().to_string();
        if self.fetchers.insert(kind.clone(), fetcher).is_some() {
            tracing::warn!(kind, "Replacing fetcher registered for the same kind");
        }
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.fetchers.keys().cloned().collect()
    }
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use vs_core::config::CommandFetcherConfig;

    fn request(params: serde_json::Value) -> FetchRequest {
        FetchRequest {
            job_id: JobId::new(),
            kind: "http".into(),
            source_id: SourceId::from("movies"),
            target_rel_path: "a/x.mp4".into(),
            target_path: PathBuf::from("/media/movies/a/x.mp4"),
            params,
        }
    }

    #[test]
    fn progress_sender_forwards() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sender = ProgressSender::new(move |pct, phase| {
            sink.lock().push((pct, phase.map(str::to_string)));
        });
        sender.send(12.5, Some("downloading"));
        sender.send(100.0, None);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[0].1.as_deref(), Some("downloading"));
        ProgressSender::noop().send(1.0, None);
    }

    #[test]
    fn params_and_staging_path() {
        let req = request(serde_json::json!({"url": "http://example.test/x.mp4"}));
        assert_eq!(req.param_str("url").unwrap(), "http://example.test/x.mp4");
        assert_eq!(req.param_str("missing").unwrap_err().kind(), "validation");
        assert_eq!(req.staging_path(), PathBuf::from("/media/movies/a/x.mp4.part"));
    }

    #[test]
    fn registry_from_config() {
        let mut config = FetchersConfig::default();
        config.commands.push(CommandFetcherConfig {
            kind: "ytdlp".into(),
            program: PathBuf::from("yt-dlp"),
            args: vec!["-o".into(), "{output}".into(), "{url}".into()],
        });
        let registry = FetcherRegistry::from_config(&config).unwrap();
        assert_eq!(registry.kinds(), vec!["http".to_string(), "ytdlp".to_string()]);
        assert!(registry.get("torrent").is_none());
    }

    #[test]
    fn http_can_be_disabled() {
        let mut config = FetchersConfig::default();
        config.http.enabled = false;
        assert!(FetcherRegistry::from_config(&config).unwrap().kinds().is_empty());
    }
}
