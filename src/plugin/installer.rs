use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::model::check::CheckResult;
use crate::model::profile::Profile;
use crate::plugin::download::{ContentPolicy, DownloadError, DownloadSink, Progress};

/// Lifecycle of one download task.
///
/// `Pending → Downloading → {Downloaded, Failed}`, and when the profile
/// installs, `Downloaded → {Installed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Downloading,
    Downloaded,
    Installed,
    Failed,
}

/// Everything a task needs to fetch and place one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub plugin: String,
    pub latest_version: String,
    pub url: String,
    pub policy: ContentPolicy,
    /// The jar currently in use.
    pub installed_path: PathBuf,
}

impl DownloadJob {
    /// `None` when the result carries no latest version or no url.
    pub fn from_result(result: &CheckResult) -> Option<Self> {
        Some(Self {
            plugin: result.name().to_string(),
            latest_version: result.latest_version()?.to_string(),
            url: result.download_url.clone()?,
            policy: ContentPolicy::archive(result.plugin.ignore_content_type),
            installed_path: result.plugin.path.clone(),
        })
    }
}

/// Terminal state of a task, sent back to whoever owns the check result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub plugin: String,
    pub state: TaskState,
    pub artifact: Option<PathBuf>,
    pub bytes: u64,
    pub error: Option<DownloadError>,
}

impl TaskReport {
    pub fn failed(plugin: impl Into<String>, error: DownloadError) -> Self {
        Self {
            plugin: plugin.into(),
            state: TaskState::Failed,
            artifact: None,
            bytes: 0,
            error: Some(error),
        }
    }
}

/// Downloads an artifact and, depending on the profile, stages or installs it.
///
/// Bytes always land in a task-local `.part` file first. MANUAL renames it
/// into the staging directory; AUTOMATIC copies it next to the live jar and
/// renames it over the target, so a failure before that rename leaves the
/// live installation untouched.
#[derive(Debug, Clone)]
pub struct Installer {
    profile: Profile,
    downloads_dir: PathBuf,
    plugins_dir: PathBuf,
    versioned_file_names: bool,
}

impl Installer {
    pub fn new(
        profile: Profile,
        downloads_dir: impl Into<PathBuf>,
        plugins_dir: impl Into<PathBuf>,
        versioned_file_names: bool,
    ) -> Self {
        Self {
            profile,
            downloads_dir: downloads_dir.into(),
            plugins_dir: plugins_dir.into(),
            versioned_file_names,
        }
    }

    pub fn staging_path(&self, job: &DownloadJob) -> PathBuf {
        self.downloads_dir.join(format!(
            "{}[{}].jar",
            file_label(&job.plugin),
            file_label(&job.latest_version)
        ))
    }

    fn temp_path(&self, job: &DownloadJob) -> PathBuf {
        self.downloads_dir.join(format!(
            ".{}[{}].jar.part",
            file_label(&job.plugin),
            file_label(&job.latest_version)
        ))
    }

    /// Where the new jar goes live.
    pub fn install_path(&self, job: &DownloadJob) -> PathBuf {
        if !self.versioned_file_names {
            return job.installed_path.clone();
        }

        let dir = job
            .installed_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.plugins_dir.clone());
        dir.join(format!(
            "{}-LATEST-[{}].jar",
            file_label(&job.plugin),
            file_label(&job.latest_version)
        ))
    }

    /// Runs one task to a terminal state and always returns a report. A
    /// panic inside the sink or the placement ends the task as `Failed`.
    pub async fn run(
        &self,
        job: &DownloadJob,
        sink: &dyn DownloadSink,
        cancel: &CancellationToken,
    ) -> TaskReport {
        match AssertUnwindSafe(self.attempt(job, sink, cancel))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(_) => {
                discard(&self.temp_path(job)).await;
                tracing::error!(plugin = %job.plugin, state = ?TaskState::Failed, "download task panicked");
                TaskReport::failed(&job.plugin, DownloadError::Panicked)
            }
        }
    }

    async fn attempt(
        &self,
        job: &DownloadJob,
        sink: &dyn DownloadSink,
        cancel: &CancellationToken,
    ) -> TaskReport {
        if !self.profile.allows_download() {
            return TaskReport::failed(&job.plugin, DownloadError::ProfileForbids(self.profile.label()));
        }

        let progress = Progress::default();
        let temp = self.temp_path(job);
        tracing::info!(plugin = %job.plugin, version = %job.latest_version, state = ?TaskState::Downloading, "downloading update");

        let downloaded = tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            res = self.download(job, sink, &temp, &progress) => res,
        };

        let bytes = match downloaded {
            Ok(bytes) => {
                tracing::debug!(plugin = %job.plugin, transferred = progress.transferred(), total = ?progress.total(), state = ?TaskState::Downloaded, "download complete");
                bytes
            }
            Err(err) => {
                discard(&temp).await;
                tracing::warn!(plugin = %job.plugin, error = %err, state = ?TaskState::Failed, "download failed");
                return TaskReport::failed(&job.plugin, err);
            }
        };

        let placed = if self.profile.installs() {
            self.install(job, &temp).await.map(|path| (TaskState::Installed, path))
        } else {
            self.stage(job, &temp).await.map(|path| (TaskState::Downloaded, path))
        };

        match placed {
            Ok((state, path)) => {
                tracing::info!(plugin = %job.plugin, state = ?state, path = %path.display(), bytes, "update placed");
                TaskReport {
                    plugin: job.plugin.clone(),
                    state,
                    artifact: Some(path),
                    bytes,
                    error: None,
                }
            }
            Err(err) => {
                discard(&temp).await;
                tracing::warn!(plugin = %job.plugin, error = %err, state = ?TaskState::Failed, "placing update failed");
                TaskReport {
                    bytes,
                    ..TaskReport::failed(&job.plugin, err)
                }
            }
        }
    }

    async fn download(
        &self,
        job: &DownloadJob,
        sink: &dyn DownloadSink,
        temp: &Path,
        progress: &Progress,
    ) -> Result<u64, DownloadError> {
        tokio::fs::create_dir_all(&self.downloads_dir).await?;
        discard(temp).await;
        sink.stream(&job.url, temp, &job.policy, progress).await
    }

    async fn stage(&self, job: &DownloadJob, temp: &Path) -> Result<PathBuf, DownloadError> {
        let staged = self.staging_path(job);
        tokio::fs::rename(temp, &staged).await?;
        Ok(staged)
    }

    async fn install(&self, job: &DownloadJob, temp: &Path) -> Result<PathBuf, DownloadError> {
        let target = self.install_path(job);
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Copy next to the target first so the final rename stays on one filesystem.
        let incoming = target.with_extension("jar.incoming");
        if let Err(err) = tokio::fs::copy(temp, &incoming).await {
            discard(&incoming).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&incoming, &target).await {
            discard(&incoming).await;
            return Err(err.into());
        }

        if target != job.installed_path && tokio::fs::try_exists(&job.installed_path).await? {
            tokio::fs::remove_file(&job.installed_path).await?;
            tracing::debug!(plugin = %job.plugin, removed = %job.installed_path.display(), "removed superseded jar");
        }

        discard(temp).await;
        Ok(target)
    }
}

/// Keeps a plugin name or version from escaping the directory it is
/// joined onto.
fn file_label(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "could not remove temporary file");
        }
    }
}
