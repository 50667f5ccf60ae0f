//! External downloader run as a child process (yt-dlp and friends).

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use vs_core::config::CommandFetcherConfig;
use vs_core::{Error, Result};

use crate::fetcher::{FetchOutcome, FetchRequest, Fetcher, ProgressSender};

/// Lines of output kept for the error message of a failed run.
const TAIL_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct CommandFetcher {
    config: CommandFetcherConfig,
}

impl CommandFetcher {
    pub fn new(config: CommandFetcherConfig) -> Self {
        Self { config }
    }

    fn program_name(&self) -> String {
        self.config
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.program.to_string_lossy().into_owned())
    }

    /// Substitute `{url}` and `{output}` in the configured arguments.
    fn build_args(&self, request: &FetchRequest) -> Result<Vec<String>> {
        let output = request.staging_path().to_string_lossy().into_owned();
        let needs_url = self.config.args.iter().any(|a| a.contains("{url}"));
        let url = if needs_url {
            request.param_str("url")?
        } else {
            ""
        };
        Ok(self
            .config
            .args
            .iter()
            .map(|a| a.replace("{url}", url).replace("{output}", &output))
            .collect())
    }
}

/// Last percentage figure on a line of downloader output, e.g. `45.3` from
/// `[download]  45.3% of 1.2GiB`.
pub fn parse_percent(line: &str) -> Option<f64> {
    let mut found = None;
    for (idx, _) in line.match_indices('%') {
        let head = &line[..idx];
        let start = head
            .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
            .map(|i| i + 1)
            .unwrap_or(0);
        if let Ok(value) = head[start..].parse::<f64>() {
            found = Some(value.clamp(0.0, 100.0));
        }
    }
    found
}

/// Read a child stream and hand each `\n`- or `\r`-terminated line to
/// `on_line`.
async fn pump_lines<R: AsyncRead + Unpin>(reader: Option<R>, on_line: impl Fn(&str)) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !line.is_empty() {
                    on_line(&String::from_utf8_lossy(&line));
                    line.clear();
                }
            } else {
                line.push(b);
            }
        }
    }
    if !line.is_empty() {
        on_line(&String::from_utf8_lossy(&line));
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    fn kind(&self) -> &str {
        &self.config.kind
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let tool = self.program_name();
        let args = self.build_args(request)?;
        if tokio::fs::try_exists(&request.target_path).await? {
            return Err(Error::Conflict(format!(
                "{}/{} already exists",
                request.source_id, request.target_rel_path
            )));
        }
        if let Some(parent) = request.target_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::info!(job_id = %request.job_id, tool = %tool, "Starting downloader");
        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tool {
                tool: tool.clone(),
                message: format!("failed to spawn: {e}"),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tail = Mutex::new(VecDeque::with_capacity(TAIL_LINES));
        let on_line = |line: &str| {
            if let Some(pct) = parse_percent(line) {
                progress.send(pct, Some("downloading"));
            }
            let mut tail = tail.lock();
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.trim().to_string());
        };

        let status = tokio::select! {
            status = async {
                tokio::join!(pump_lines(stdout, on_line), pump_lines(stderr, on_line));
                child.wait().await
            } => Some(status),
            _ = cancel.cancelled() => None,
        };

        let Some(status) = status else {
            let _ = child.kill().await;
            let _ = self.cleanup(request).await;
            tracing::info!(job_id = %request.job_id, tool = %tool, "Downloader killed on cancellation");
            return Err(Error::Fetch("cancelled".into()));
        };
        let status = status.map_err(|e| Error::Tool {
            tool: tool.clone(),
            message: format!("failed waiting for process: {e}"),
        })?;

        if !status.success() {
            let tail: Vec<String> = tail.into_inner().into_iter().collect();
            return Err(Error::Fetch(format!(
                "{tool} exited with {status}: {}",
                tail.join(" | ")
            )));
        }

        let staging = request.staging_path();
        if !tokio::fs::try_exists(&staging).await? {
            return Err(Error::Fetch(format!(
                "{tool} finished without writing {}",
                staging.display()
            )));
        }
        tokio::fs::rename(&staging, &request.target_path).await?;
        progress.send(100.0, Some("complete"));
        Ok(FetchOutcome::at(request.target_path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use vs_core::{JobId, SourceId};

    #[test]
    fn percent_parsing() {
        assert_eq!(parse_percent("[download]  45.3% of 1.2GiB at 3MiB/s"), Some(45.3));
        assert_eq!(parse_percent("100%"), Some(100.0));
        assert_eq!(parse_percent("progress 7% then 12%"), Some(12.0));
        assert_eq!(parse_percent("no numbers here"), None);
        assert_eq!(parse_percent("% leading"), None);
    }

    fn fetcher(script: &str) -> CommandFetcher {
        CommandFetcher::new(CommandFetcherConfig {
            kind: "script".into(),
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into(), "sh".into(), "{output}".into(), "{url}".into()],
        })
    }

    fn request(dir: &Path) -> FetchRequest {
        FetchRequest {
            job_id: JobId::new(),
            kind: "script".into(),
            source_id: SourceId::from("movies"),
            target_rel_path: "x.mp4".into(),
            target_path: dir.join("x.mp4"),
            params: serde_json::json!({ "url": "https://example.test/v" }),
        }
    }

    #[test]
    fn placeholders_are_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let args = fetcher("true").build_args(&req).unwrap();
        assert_eq!(args[3], req.staging_path().to_string_lossy());
        assert_eq!(args[4], "https://example.test/v");
    }

    #[tokio::test]
    async fn successful_run_moves_output_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = ProgressSender::new(move |pct, _| sink.lock().push(pct));

        let f = fetcher("echo '[download]  50.0% of 1MiB'; printf data > \"$1\"");
        let outcome = f.fetch(&req, &progress, CancellationToken::new()).await.unwrap();
        assert_eq!(std::fs::read(&outcome.output_path).unwrap(), b"data");
        assert!(seen.lock().contains(&50.0));
        assert!(!req.staging_path().exists());
    }

    #[tokio::test]
    async fn failing_run_reports_output_tail() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let err = fetcher("echo 'ERROR: unsupported URL' >&2; exit 3")
            .fetch(&req, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(err.to_string().contains("unsupported URL"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = fetcher("printf partial > \"$1\"; sleep 30")
            .fetch(&req, &ProgressSender::noop(), cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!req.staging_path().exists());
        assert!(!req.target_path.exists());
    }
}
