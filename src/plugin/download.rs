//! Streaming artifacts to disk.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("download from {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("download from {url} failed with status {status}")]
    Status { url: String, status: u16 },

    #[error("refusing download with content type '{found}'")]
    ContentType { found: String },

    #[error("{url} leads to a purchase page; the resource is not owned by this account")]
    NotOwned { url: String },

    #[error("file operation failed: {0}")]
    Io(String),

    #[error("authenticated session unavailable: {0}")]
    Session(String),

    #[error("profile {0} does not allow downloads")]
    ProfileForbids(&'static str),

    #[error("download cancelled")]
    Cancelled,

    #[error("download task panicked")]
    Panicked,
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::Io(err.to_string())
    }
}

/// Which response content types are acceptable as a plugin archive.
///
/// The top-level type must always be `application`. Unless the plugin is
/// configured to ignore content types, the subtype must also be one of the
/// archive subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentPolicy {
    pub ignore_subtype: bool,
}

const ARCHIVE_SUBTYPES: [&str; 3] = ["java-archive", "jar", "octet-stream"];

impl ContentPolicy {
    pub fn archive(ignore_content_type: bool) -> Self {
        Self {
            ignore_subtype: ignore_content_type,
        }
    }

    pub fn check(&self, content_type: Option<&str>) -> Result<(), DownloadError> {
        let Some(raw) = content_type else {
            return Err(DownloadError::ContentType {
                found: "<none>".to_string(),
            });
        };

        let essence = raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        let (kind, subtype) = essence.split_once('/').unwrap_or((essence.as_str(), ""));

        if kind != "application" {
            return Err(DownloadError::ContentType {
                found: raw.to_string(),
            });
        }
        if !self.ignore_subtype && !ARCHIVE_SUBTYPES.contains(&subtype) {
            return Err(DownloadError::ContentType {
                found: raw.to_string(),
            });
        }
        Ok(())
    }
}

/// Bytes transferred so far and the expected total (0 when unknown).
#[derive(Debug, Default)]
pub struct Progress {
    transferred: AtomicU64,
    total: AtomicU64,
}

impl Progress {
    pub fn set_total(&self, total: Option<u64>) {
        self.total.store(total.unwrap_or(0), Ordering::Relaxed);
    }

    pub fn advance(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Relaxed) {
            0 => None,
            total => Some(total),
        }
    }
}

#[async_trait]
pub trait DownloadSink: Send + Sync {
    /// Streams `url` into `dest`, returning the number of bytes written.
    ///
    /// The content type is validated before any byte is written.
    async fn stream(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DownloadSink for HttpDownloader {
    async fn stream(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError> {
        tracing::debug!(url, dest = %dest.display(), "downloading");
        let response = self.client.get(url).send().await.map_err(|e| DownloadError::Http {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        write_response(response, dest, policy, progress).await
    }
}

/// Validates and streams a response body into `dest`.
pub(crate) async fn write_response(
    response: reqwest::Response,
    dest: &Path,
    policy: &ContentPolicy,
    progress: &Progress,
) -> Result<u64, DownloadError> {
    let url = response.url().to_string();
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url,
            status: status.as_u16(),
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    policy.check(content_type)?;
    progress.set_total(response.content_length());

    let mut file = tokio::fs::File::create(dest).await?;
    let mut written = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| DownloadError::Http {
            url: url.clone(),
            message: e.to_string(),
        })?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress.advance(chunk.len() as u64);
    }
    file.flush().await?;
    file.sync_all().await?;

    Ok(written)
}
