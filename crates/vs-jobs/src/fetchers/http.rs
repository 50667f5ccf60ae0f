//! Direct HTTP download.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use vs_core::{Error, Result};

use crate::fetcher::{FetchOutcome, FetchRequest, Fetcher, ProgressSender};

/// Streams a URL (job parameter `url`) into `<target>.part`, then renames
/// it into place.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub const KIND: &'static str = "http";

    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &ProgressSender,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let url = request.param_str("url")?;
        if tokio::fs::try_exists(&request.target_path).await? {
            return Err(Error::Conflict(format!(
                "{}/{} already exists",
                request.source_id, request.target_rel_path
            )));
        }
        if let Some(parent) = request.target_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        progress.send(0.0, Some("connecting"));
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Fetch("cancelled".into())),
            resp = self.client.get(url).send() => resp.map_err(|e| Error::Fetch(format!("request failed: {e}")))?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {status} from {url}")));
        }

        let total = response.content_length().filter(|n| *n > 0);
        let staging = request.staging_path();
        let mut file = tokio::fs::File::create(&staging).await?;
        let mut received: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&staging).await;
                    return Err(Error::Fetch("cancelled".into()));
                }
                chunk = response.chunk() => chunk.map_err(|e| Error::Fetch(format!("download interrupted: {e}")))?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total {
                progress.send(
                    (received as f64 / total as f64 * 100.0).min(100.0),
                    Some("downloading"),
                );
            }
        }

        file.flush().await?;
        drop(file);
        if let Some(total) = total {
            if received < total {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(Error::Fetch(format!(
                    "connection closed after {received} of {total} bytes"
                )));
            }
        }

        tokio::fs::rename(&staging, &request.target_path).await?;
        progress.send(100.0, Some("complete"));
        tracing::debug!(job_id = %request.job_id, bytes = received, url, "Download finished");
        Ok(FetchOutcome::at(request.target_path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use vs_core::{JobId, SourceId};

    /// Serve one canned response on a local port.
    async fn serve_once(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/file.mp4")
    }

    fn request(dir: &std::path::Path, url: &str) -> FetchRequest {
        FetchRequest {
            job_id: JobId::new(),
            kind: "http".into(),
            source_id: SourceId::from("movies"),
            target_rel_path: "sub/x.mp4".into(),
            target_path: dir.join("sub/x.mp4"),
            params: serde_json::json!({ "url": url }),
        }
    }

    #[tokio::test]
    async fn downloads_into_target() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("200 OK", b"hello video").await;
        let req = request(dir.path(), &url);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress = ProgressSender::new(move |pct, _| sink.lock().push(pct));

        let fetcher = HttpFetcher::new("vidshelf-test").unwrap();
        let outcome = fetcher
            .fetch(&req, &progress, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.output_path, dir.path().join("sub/x.mp4"));
        assert_eq!(std::fs::read(&outcome.output_path).unwrap(), b"hello video");
        assert!(!req.staging_path().exists());
        assert_eq!(seen.lock().last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn http_error_is_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("404 Not Found", b"").await;
        let req = request(dir.path(), &url);
        let err = HttpFetcher::new("t")
            .unwrap()
            .fetch(&req, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert!(!req.target_path.exists());
    }

    #[tokio::test]
    async fn missing_url_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path(), "");
        req.params = serde_json::json!({});
        let err = HttpFetcher::new("t")
            .unwrap()
            .fetch(&req, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn existing_target_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/x.mp4"), b"old").unwrap();
        let req = request(dir.path(), "http://127.0.0.1:9/never");
        let err = HttpFetcher::new("t")
            .unwrap()
            .fetch(&req, &ProgressSender::noop(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert_eq!(std::fs::read(&req.target_path).unwrap(), b"old");
    }
}
