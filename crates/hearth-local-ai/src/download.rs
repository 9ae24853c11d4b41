//! Cancellable file downloads.
//!
//! A download writes to `<dest>.partial` and renames it into place once the
//! body has been fully received, so the destination path never holds a
//! truncated file. A destination that already exists counts as complete and
//! is not fetched again.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Response, StatusCode};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::LocalAIError;
use crate::paths::partial_path;

/// Single-shot cancellation signal. Once cancelled it stays cancelled;
/// re-arming means creating a new one.
pub type CancelSignal = CancellationToken;

/// Channel progress events are published on.
pub type ProgressSender = mpsc::UnboundedSender<DownloadProgress>;

/// Time between aborting a request and closing the partial file.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Time between closing the partial file and deleting it.
pub const DEFAULT_UNLINK_GRACE: Duration = Duration::from_millis(200);

/// Progress of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub bytes_transferred: u64,
    /// `None` when the server sent no `content-length`.
    pub bytes_total: Option<u64>,
    /// In `[0, 1]`, or NaN while the total is unknown.
    pub fraction: f64,
}

impl DownloadProgress {
    /// Progress after `transferred` bytes out of `total`.
    pub fn new(transferred: u64, total: Option<u64>) -> Self {
        let fraction = match total {
            Some(0) => 1.0,
            Some(total) => (transferred as f64 / total as f64).min(1.0),
            None => f64::NAN,
        };
        Self {
            bytes_transferred: transferred,
            bytes_total: total,
            fraction,
        }
    }

    /// The event emitted before any byte arrives.
    pub fn started() -> Self {
        Self {
            bytes_transferred: 0,
            bytes_total: None,
            fraction: 0.0,
        }
    }

    /// A finished transfer of `size` bytes.
    pub fn complete(size: u64) -> Self {
        Self {
            bytes_transferred: size,
            bytes_total: Some(size),
            fraction: 1.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.fraction >= 1.0
    }
}

/// Fetches remote files to local paths.
#[derive(Debug, Clone)]
pub struct DownloadPipeline {
    client: reqwest::Client,
    close_grace: Duration,
    unlink_grace: Duration,
}

impl DownloadPipeline {
    /// Create a pipeline. Redirects are handled by the pipeline itself.
    pub fn new() -> Result<Self, LocalAIError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;
        Ok(Self {
            client,
            close_grace: DEFAULT_CLOSE_GRACE,
            unlink_grace: DEFAULT_UNLINK_GRACE,
        })
    }

    /// Override the delays observed while cleaning up after a cancellation.
    pub fn with_grace_periods(mut self, close: Duration, unlink: Duration) -> Self {
        self.close_grace = close;
        self.unlink_grace = unlink;
        self
    }

    /// Run a download in the background.
    pub fn start(
        &self,
        url: impl Into<String>,
        dest: impl Into<PathBuf>,
        sha256: Option<String>,
        cancel: CancelSignal,
    ) -> Download {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = self.clone();
        let url = url.into();
        let dest = dest.into();
        let task = tokio::spawn(async move {
            pipeline
                .download_verified(&url, &dest, sha256.as_deref(), &cancel, &tx)
                .await
        });
        Download { progress: rx, task }
    }

    /// Download `url` to `dest`, publishing progress on `progress`.
    pub async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelSignal,
        progress: &ProgressSender,
    ) -> Result<PathBuf, LocalAIError> {
        self.download_verified(url, dest, None, cancel, progress)
            .await
    }

    /// Like [`download`](Self::download), refusing a body whose SHA256 differs from `sha256`.
    pub async fn download_verified(
        &self,
        url: &str,
        dest: &Path,
        sha256: Option<&str>,
        cancel: &CancelSignal,
        progress: &ProgressSender,
    ) -> Result<PathBuf, LocalAIError> {
        let _ = progress.send(DownloadProgress::started());

        if let Ok(meta) = fs::metadata(dest).await {
            debug!("{:?} already present, skipping download", dest);
            let _ = progress.send(DownloadProgress::complete(meta.len()));
            return Ok(dest.to_path_buf());
        }

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let partial = partial_path(dest);
        let mut file = File::create(&partial).await?;

        info!("Downloading {} to {:?}", url, dest);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LocalAIError::Cancelled),
            result = self.transfer(url, &mut file, sha256, progress) => result,
        };

        match result {
            Ok(size) => {
                drop(file);
                if let Err(e) = fs::rename(&partial, dest).await {
                    remove_partial(&partial).await;
                    return Err(e.into());
                }
                let _ = progress.send(DownloadProgress::complete(size));
                info!("Downloaded {} bytes to {:?}", size, dest);
                Ok(dest.to_path_buf())
            }
            Err(LocalAIError::Cancelled) => {
                info!("Download of {} cancelled", url);
                // In-flight writes settle before the handle closes, and the
                // handle closes before the file is unlinked.
                tokio::time::sleep(self.close_grace).await;
                drop(file);
                tokio::time::sleep(self.unlink_grace).await;
                remove_partial(&partial).await;
                Err(LocalAIError::Cancelled)
            }
            Err(e) => {
                warn!("Download of {} failed: {}", url, e);
                drop(file);
                remove_partial(&partial).await;
                Err(e)
            }
        }
    }

    /// Stream the response body into `file`. Returns the byte count.
    async fn transfer(
        &self,
        url: &str,
        file: &mut File,
        sha256: Option<&str>,
        progress: &ProgressSender,
    ) -> Result<u64, LocalAIError> {
        let response = self.request(url).await?;
        let total = response.content_length();
        let mut hasher = sha256.map(|_| Sha256::new());
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            downloaded += chunk.len() as u64;
            let _ = progress.send(DownloadProgress::new(downloaded, total));
        }
        file.flush().await?;

        if let (Some(expected), Some(hasher)) = (sha256, hasher) {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(LocalAIError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            debug!("Checksum verified: {}", actual);
        }

        Ok(downloaded)
    }

    /// GET `url`, following at most one `302`.
    async fn request(&self, url: &str) -> Result<Response, LocalAIError> {
        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::FOUND => {
                let target = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|location| response.url().join(location).ok())
                    .ok_or_else(|| LocalAIError::BadRedirect(url.to_string()))?;
                debug!("Following redirect {} -> {}", url, target);

                let response = self.client.get(target).send().await?;
                if response.status() == StatusCode::OK {
                    Ok(response)
                } else {
                    Err(status_error(response.status()))
                }
            }
            status => Err(status_error(status)),
        }
    }
}

/// A download running in the background.
pub struct Download {
    progress: mpsc::UnboundedReceiver<DownloadProgress>,
    task: JoinHandle<Result<PathBuf, LocalAIError>>,
}

impl Download {
    /// Next progress event, or `None` once the transfer has ended.
    pub async fn progress(&mut self) -> Option<DownloadProgress> {
        self.progress.recv().await
    }

    /// Wait for the outcome.
    pub async fn finish(self) -> Result<PathBuf, LocalAIError> {
        self.task.await?
    }

    /// Separate the progress stream from the task producing the outcome.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<DownloadProgress>,
        JoinHandle<Result<PathBuf, LocalAIError>>,
    ) {
        (self.progress, self.task)
    }
}

fn status_error(status: StatusCode) -> LocalAIError {
    LocalAIError::DownloadFailed {
        status: status.as_u16(),
        message: status.canonical_reason().unwrap_or("").to_string(),
    }
}

async fn remove_partial(partial: &Path) {
    if let Err(e) = fs::remove_file(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {:?}: {}", partial, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn pipeline() -> DownloadPipeline {
        DownloadPipeline::new()
            .unwrap()
            .with_grace_periods(Duration::from_millis(20), Duration::from_millis(40))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<DownloadProgress>) -> Vec<DownloadProgress> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(DownloadProgress::new(50, Some(200)).fraction, 0.25);
        assert!(DownloadProgress::new(50, None).fraction.is_nan());
        assert!(DownloadProgress::complete(10).is_complete());
        assert!(!DownloadProgress::started().is_complete());
    }

    #[tokio::test]
    async fn test_existing_file_skips_network() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/model.gguf");
                then.status(200).body("remote");
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        std::fs::write(&dest, "cached").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let path = pipeline()
            .download(&server.url("/model.gguf"), &dest, &CancelSignal::new(), &tx)
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "cached");
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&DownloadProgress::complete(6)));
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn test_downloads_into_nested_dir() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/model.gguf");
                then.status(200).body("hello world");
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("qwen").join("model.gguf");
        let (tx, mut rx) = mpsc::unbounded_channel();
        pipeline()
            .download(&server.url("/model.gguf"), &dest, &CancelSignal::new(), &tx)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello world");
        assert!(!partial_path(&dest).exists());

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&DownloadProgress::started()));
        assert_eq!(events.last(), Some(&DownloadProgress::complete(11)));
        assert!(events
            .windows(2)
            .all(|w| w[0].bytes_transferred <= w[1].bytes_transferred));
    }

    #[tokio::test]
    async fn test_follows_single_redirect() {
        let server = MockServer::start_async().await;
        let target = server
            .mock_async(|when, then| {
                when.method(GET).path("/cdn/model.gguf");
                then.status(200).body("from cdn");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/resolve/model.gguf");
                then.status(302)
                    .header("Location", server.url("/cdn/model.gguf"));
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let (tx, _rx) = mpsc::unbounded_channel();
        pipeline()
            .download(
                &server.url("/resolve/model.gguf"),
                &dest,
                &CancelSignal::new(),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "from cdn");
        target.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_second_redirect_is_not_followed() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/a");
                then.status(302).header("Location", server.url("/b"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/b");
                then.status(302).header("Location", server.url("/c"));
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pipeline()
            .download(&server.url("/a"), &dest, &CancelSignal::new(), &tx)
            .await
            .unwrap_err();

        assert!(matches!(err, LocalAIError::DownloadFailed { status: 302, .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_error_status_leaves_no_file() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing.gguf");
                then.status(404);
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.gguf");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pipeline()
            .download(&server.url("/missing.gguf"), &dest, &CancelSignal::new(), &tx)
            .await
            .unwrap_err();

        match err {
            LocalAIError::DownloadFailed { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "Not Found");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_cancel_removes_partial_file() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slow.gguf");
                then.status(200)
                    .body("never arrives")
                    .delay(Duration::from_secs(10));
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("slow.gguf");
        let cancel = CancelSignal::new();
        let mut download = pipeline().start(server.url("/slow.gguf"), &dest, None, cancel.clone());

        assert_eq!(download.progress().await, Some(DownloadProgress::started()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(partial_path(&dest).exists());

        let cancelled_at = Instant::now();
        cancel.cancel();
        // A second signal is a no-op.
        cancel.cancel();
        let err = download.finish().await.unwrap_err();

        assert!(matches!(err, LocalAIError::Cancelled));
        assert!(cancelled_at.elapsed() >= Duration::from_millis(60));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_download() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/model.gguf");
                then.status(200).body("tampered");
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = pipeline()
            .download_verified(
                &server.url("/model.gguf"),
                &dest,
                Some("00"),
                &CancelSignal::new(),
                &tx,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LocalAIError::ChecksumMismatch { .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_checksum_match_keeps_download() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/model.gguf");
                then.status(200).body("abc");
            })
            .await;

        let dir = tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let (tx, _rx) = mpsc::unbounded_channel();
        let expected = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        pipeline()
            .download_verified(
                &server.url("/model.gguf"),
                &dest,
                Some(expected),
                &CancelSignal::new(),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "abc");
    }
}
