use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::model::check::{CheckResult, ResultCode};
use crate::msg::Msg;
use crate::plugin::download::DownloadSink;
use crate::plugin::installer::{DownloadJob, Installer, TaskReport, TaskState};

/// Runs ordinary (non-premium) downloads concurrently.
///
/// Each scheduled job becomes a tokio task that reports back with exactly
/// one `Msg::TaskFinished`. `max_parallel == 0` means unbounded.
pub struct DownloadManager {
    installer: Installer,
    sink: Arc<dyn DownloadSink>,
    slots: Option<Arc<Semaphore>>,
    tx: UnboundedSender<Msg>,
    cancel: CancellationToken,
    in_flight: usize,
    scheduled: usize,
}

impl DownloadManager {
    pub fn new(
        installer: Installer,
        sink: Arc<dyn DownloadSink>,
        max_parallel: usize,
        tx: UnboundedSender<Msg>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            installer,
            sink,
            slots: (max_parallel > 0).then(|| Arc::new(Semaphore::new(max_parallel))),
            tx,
            cancel,
            in_flight: 0,
            scheduled: 0,
        }
    }

    pub fn schedule(&mut self, job: DownloadJob) {
        self.in_flight += 1;
        self.scheduled += 1;
        tracing::debug!(plugin = %job.plugin, in_flight = self.in_flight, state = ?TaskState::Pending, "scheduled download");

        let installer = self.installer.clone();
        let sink = Arc::clone(&self.sink);
        let slots = self.slots.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _permit = match slots {
                Some(slots) => tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = slots.acquire_owned() => permit.ok(),
                },
                None => None,
            };

            let report = installer.run(&job, sink.as_ref(), &cancel).await;
            if tx.send(Msg::TaskFinished(report)).is_err() {
                tracing::debug!(plugin = %job.plugin, "run loop gone, dropping task report");
            }
        });
    }

    /// Called once per `Msg::TaskFinished` coming from this manager.
    pub fn finished(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn scheduled(&self) -> usize {
        self.scheduled
    }
}

/// A finished task whose plugin has no check result. Indicates a bug in
/// the run loop, not an environmental failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("finished task for '{0}' matches no check result")]
pub struct UnmatchedTask(pub String);

/// Check results by plugin name. The only place a result's terminal state
/// changes after triage.
#[derive(Debug, Default)]
pub struct ResultBook {
    results: HashMap<String, CheckResult>,
    failed: HashSet<String>,
}

impl ResultBook {
    pub fn insert(&mut self, result: CheckResult) {
        self.results.insert(result.name().to_string(), result);
    }

    /// Moves the matching result to `DOWNLOADED`/`INSTALLED` for a
    /// successful task and returns its code afterwards.
    pub fn apply(&mut self, report: &TaskReport) -> Result<ResultCode, UnmatchedTask> {
        let result = self
            .results
            .get_mut(&report.plugin)
            .ok_or_else(|| UnmatchedTask(report.plugin.clone()))?;

        match report.state {
            TaskState::Downloaded => {
                result.mark_downloaded();
            }
            TaskState::Installed => {
                result.mark_installed();
            }
            TaskState::Failed => {
                self.failed.insert(report.plugin.clone());
            }
            TaskState::Pending | TaskState::Downloading => {}
        }
        Ok(result.code())
    }

    /// Results sorted by plugin name, each with whether its task failed.
    pub fn into_sorted(self) -> Vec<(CheckResult, bool)> {
        let failed = self.failed;
        let mut results: Vec<_> = self
            .results
            .into_values()
            .map(|result| {
                let task_failed = failed.contains(result.name());
                (result, task_failed)
            })
            .collect();
        results.sort_by(|(a, _), (b, _)| a.name().cmp(b.name()));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::profile::Profile;
    use crate::model::record::PluginRecord;
    use crate::plugin::download::{ContentPolicy, DownloadError};
    use crate::test_support::RecordingSink;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn job(dir: &TempDir, name: &str) -> DownloadJob {
        DownloadJob {
            plugin: name.to_string(),
            latest_version: "2.0".into(),
            url: format!("https://downloads.invalid/{name}.jar"),
            policy: ContentPolicy::archive(false),
            installed_path: dir.path().join(format!("plugins/{name}.jar")),
        }
    }

    #[tokio::test]
    async fn every_scheduled_job_reports_once() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = RecordingSink::serving(b"jar")
            .with_delay(Duration::from_millis(10))
            .with_content_type("https://downloads.invalid/Bad.jar", "text/html");
        let mut manager = DownloadManager::new(
            Installer::new(
                Profile::Manual,
                dir.path().join("downloads"),
                dir.path().join("plugins"),
                false,
            ),
            Arc::new(sink),
            2,
            tx,
            CancellationToken::new(),
        );

        for name in ["A", "B", "Bad", "C"] {
            manager.schedule(job(&dir, name));
        }
        assert_eq!(manager.in_flight(), 4);

        let mut reports = HashMap::new();
        while manager.in_flight() > 0 {
            let Some(Msg::TaskFinished(report)) = rx.recv().await else {
                panic!("expected a task report");
            };
            manager.finished();
            reports.insert(report.plugin.clone(), report);
        }

        assert_eq!(manager.scheduled(), 4);
        assert_eq!(reports["A"].state, TaskState::Downloaded);
        assert_eq!(reports["C"].state, TaskState::Downloaded);
        assert_eq!(
            reports["Bad"].error,
            Some(DownloadError::ContentType {
                found: "text/html".into()
            })
        );
    }

    fn result(name: &str) -> CheckResult {
        let mut record = PluginRecord::new(name, PathBuf::from(format!("plugins/{name}.jar"))).unwrap();
        record.version = Some("1.0".into());
        CheckResult::from_lookup(
            Arc::new(record),
            crate::plugin::checker::Lookup {
                latest_version: "2.0".into(),
                download_url: Some("https://downloads.invalid/x.jar".into()),
                download_type: crate::model::check::DownloadType::Jar,
                ids: Default::default(),
                premium: false,
            },
        )
    }

    #[test]
    fn apply_advances_the_matching_result() {
        let mut book = ResultBook::default();
        book.insert(result("A"));
        book.insert(result("B"));

        let installed = TaskReport {
            plugin: "A".into(),
            state: TaskState::Installed,
            artifact: None,
            bytes: 3,
            error: None,
        };
        assert_eq!(book.apply(&installed), Ok(ResultCode::Installed));

        let failed = TaskReport::failed("B", DownloadError::Cancelled);
        assert_eq!(book.apply(&failed), Ok(ResultCode::UpdateAvailable));

        let sorted = book.into_sorted();
        assert_eq!(sorted[0].0.code(), ResultCode::Installed);
        assert!(!sorted[0].1);
        assert!(sorted[1].1, "failed task is remembered");
    }

    #[test]
    fn unmatched_report_is_an_error() {
        let mut book = ResultBook::default();
        book.insert(result("A"));

        let stray = TaskReport::failed("Z", DownloadError::Cancelled);
        assert_eq!(book.apply(&stray), Err(UnmatchedTask("Z".into())));
    }
}
