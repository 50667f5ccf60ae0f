//! Boundary to the playback-conversion collaborator.
//!
//! The library only needs to know whether a browser can play a file as-is
//! and how to ask for a compatible copy. The copy lands next to the source
//! and is indexed like any other media file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use vs_core::config::TranscodeConfig;
use vs_core::paths::extension_of;
use vs_core::{Error, Result};

/// Containers browsers play natively.
pub const DIRECT_PLAY_EXTENSIONS: &[&str] = &["mp4", "webm", "ogg", "ogv"];

/// Conversions taking longer than this are abandoned.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

pub fn can_play_directly(rel_path: &str) -> bool {
    extension_of(rel_path).is_some_and(|ext| DIRECT_PLAY_EXTENSIONS.contains(&ext.as_str()))
}

/// Result of a conversion request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvertOutcome {
    pub message: String,
    pub output_path: PathBuf,
}

/// Converts a media file into a browser-playable sibling.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn convert(&self, input: &Path) -> Result<ConvertOutcome>;
}

/// ffmpeg re-encode to H.264/AAC with the moov atom up front.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use the configured binary, or find `ffmpeg` on `PATH`.
    pub fn discover(config: &TranscodeConfig) -> Result<Self> {
        if let Some(path) = &config.ffmpeg_path {
            return Ok(Self::new(path.clone()));
        }
        which::which("ffmpeg")
            .map(Self::new)
            .map_err(|e| Error::Tool {
                tool: "ffmpeg".into(),
                message: format!("not found on PATH: {e}"),
            })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `{dir}/{stem}_ios.mp4` for `{dir}/{stem}.{ext}`.
    pub fn output_path_for(input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        input.with_file_name(format!("{stem}_ios.mp4"))
    }

    fn args(input: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into(), "-i".into()];
        args.push(input.to_string_lossy().into_owned());
        args.extend(
            [
                "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-profile:v", "high",
                "-level", "4.0", "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "128k",
                "-movflags", "+faststart", "-f", "mp4",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().into_owned());
        args
    }

    fn tool_err(message: impl Into<String>) -> Error {
        Error::Tool {
            tool: "ffmpeg".into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn convert(&self, input: &Path) -> Result<ConvertOutcome> {
        if !tokio::fs::try_exists(input).await? {
            return Err(Error::not_found("media file", input.display()));
        }

        let output = Self::output_path_for(input);
        if tokio::fs::try_exists(&output).await? {
            return Ok(ConvertOutcome {
                message: "playable version already exists".into(),
                output_path: output,
            });
        }

        // Written under a name the indexer ignores, then renamed into place.
        let mut temp = output.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        tracing::info!(input = %input.display(), output = %output.display(), "Starting conversion");
        let child = Command::new(&self.program)
            .args(Self::args(input, &temp))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Self::tool_err(format!("failed to spawn: {e}")))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let failure = match result {
            Ok(Ok(out)) if out.status.success() => None,
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                Some(format!(
                    "exited with status {}: {}",
                    out.status,
                    tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
                ))
            }
            Ok(Err(e)) => Some(format!("I/O error waiting for process: {e}")),
            Err(_) => Some(format!("timed out after {:?}", self.timeout)),
        };

        if let Some(message) = failure {
            let _ = tokio::fs::remove_file(&temp).await;
            tracing::warn!(input = %input.display(), error = %message, "Conversion failed");
            return Err(Self::tool_err(message));
        }

        tokio::fs::rename(&temp, &output).await?;
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ConvertOutcome {
            message: format!("converted to {name}"),
            output_path: output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_play_by_extension() {
        assert!(can_play_directly("a/b.MP4"));
        assert!(can_play_directly("clip.webm"));
        assert!(can_play_directly("x.ogv"));
        assert!(!can_play_directly("movie.mkv"));
        assert!(!can_play_directly("movie.avi"));
        assert!(!can_play_directly("noext"));
    }

    #[test]
    fn output_is_sibling_with_suffix() {
        let out = FfmpegTranscoder::output_path_for(Path::new("/media/movies/Film.mkv"));
        assert_eq!(out, PathBuf::from("/media/movies/Film_ios.mp4"));
    }

    #[test]
    fn args_end_with_output() {
        let args = FfmpegTranscoder::args(Path::new("in.mkv"), Path::new("out.tmp"));
        assert_eq!(args.last().map(String::as_str), Some("out.tmp"));
        assert!(args.windows(2).any(|w| w[0] == "-movflags" && w[1] == "+faststart"));
    }

    #[tokio::test]
    async fn existing_output_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Film.mkv");
        std::fs::write(&input, b"x").unwrap();
        std::fs::write(dir.path().join("Film_ios.mp4"), b"y").unwrap();

        let transcoder = FfmpegTranscoder::new(PathBuf::from("ffmpeg-not-needed"));
        let outcome = transcoder.convert(&input).await.unwrap();
        assert!(outcome.message.contains("already exists"));
    }

    #[tokio::test]
    async fn missing_input_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::new(PathBuf::from("ffmpeg"));
        let err = transcoder
            .convert(&dir.path().join("nope.mkv"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn missing_binary_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("Film.mkv");
        std::fs::write(&input, b"x").unwrap();
        let transcoder = FfmpegTranscoder::new(PathBuf::from("nonexistent_ffmpeg_xyz_12345"));
        let err = transcoder.convert(&input).await.unwrap_err();
        assert_eq!(err.kind(), "tool");
    }
}
