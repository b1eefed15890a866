use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::check::{CheckResult, ResultCode};
use crate::model::config::AppConfig;
use crate::model::summary::{Summary, Warning};
use crate::msg::Msg;
use crate::plugin::checker::{ProviderRouter, VersionChecker};
use crate::plugin::dispatcher::SearchDispatcher;
use crate::plugin::download::{DownloadSink, HttpDownloader};
use crate::plugin::installer::{DownloadJob, Installer, TaskReport, TaskState};
use crate::plugin::manager::{DownloadManager, ResultBook, UnmatchedTask};
use crate::plugin::manifest::{IndexManifestSource, ManifestError, ManifestSource};
use crate::plugin::providers::{
    self, BukkitChecker, CustomUrlChecker, SpigotChecker, SpigotSearchChecker,
};
use crate::plugin::session::{SessionManager, SessionOpener, SessionOutcome};
use crate::plugin::spigot_session::SpigotSessionOpener;
use crate::plugin::store::{RecordField, RecordStore, StoreError};
use crate::plugin::triage::{Disposition, Route, triage};

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("nothing to check: no included plugins")]
    NothingToCheck,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    UnmatchedTask(#[from] UnmatchedTask),
}

/// The external systems a run talks to.
pub struct Collaborators {
    pub manifests: Arc<dyn ManifestSource>,
    pub checker: Arc<dyn VersionChecker>,
    pub sink: Arc<dyn DownloadSink>,
    pub sessions: Arc<dyn SessionOpener>,
}

impl Collaborators {
    pub fn live(config: &AppConfig) -> anyhow::Result<Self> {
        let client = providers::http_client(config.check_timeout())?;
        let router = ProviderRouter::new(
            Arc::new(SpigotChecker::new(client.clone())),
            Arc::new(BukkitChecker::new(client.clone())),
            Arc::new(CustomUrlChecker::new(client.clone())),
            Arc::new(SpigotSearchChecker::new(client)),
        );

        // Artifacts can be large; only connecting is bounded.
        let download_client = reqwest::Client::builder()
            .user_agent(concat!("plugin-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.check_timeout())
            .build()?;

        Ok(Self {
            manifests: Arc::new(IndexManifestSource::new(
                config.manifest_index(),
                config.plugins_dir(),
            )),
            checker: Arc::new(router),
            sink: Arc::new(HttpDownloader::new(download_client)),
            sessions: Arc::new(SpigotSessionOpener::new(config.check_timeout())),
        })
    }
}

/// Owns one run from discovery to summary.
pub struct App {
    config: AppConfig,
    collaborators: Collaborators,
    store: RecordStore,
    cancel: CancellationToken,

    tx: mpsc::UnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
    downloads: DownloadManager,
    book: ResultBook,
    summary: Summary,

    expected_checks: usize,
    checks_done: usize,
    premium_queue: Vec<DownloadJob>,
    premium_pending: HashSet<String>,
    session_started: bool,
    session_done: bool,
}

impl App {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Result<Self, UpdateError> {
        let store = RecordStore::open(config.store_path(), config.general.keep_removed)?;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let downloads = DownloadManager::new(
            installer_for(&config),
            Arc::clone(&collaborators.sink),
            config.general.max_parallel_downloads,
            tx.clone(),
            cancel.clone(),
        );

        Ok(Self {
            config,
            collaborators,
            store,
            cancel,
            tx,
            rx,
            downloads,
            book: ResultBook::default(),
            summary: Summary::default(),
            expected_checks: 0,
            checks_done: 0,
            premium_queue: Vec::new(),
            premium_pending: HashSet::new(),
            session_started: false,
            session_done: false,
        })
    }

    /// Cancelling this token winds the run down promptly; every started
    /// check and task still reports back.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> Result<Summary, UpdateError> {
        let profile = self.config.general.profile;
        tracing::info!(profile = profile.label(), "run starting");

        let manifests = self.collaborators.manifests.discover().await?;
        let discovery = self.store.reconcile(manifests);
        self.summary.excluded = discovery.excluded;
        self.summary.warnings.extend(discovery.warnings);
        self.store.flush()?;

        let records = self.store.list_included();
        if records.is_empty() {
            tracing::error!(excluded = discovery.excluded, "nothing to check");
            return Err(UpdateError::NothingToCheck);
        }

        let dispatcher = SearchDispatcher::new(
            Arc::clone(&self.collaborators.checker),
            self.config.general.concurrency,
            self.config.general.max_parallel_checks,
            self.config.check_timeout(),
        );
        self.expected_checks = dispatcher.dispatch(records, self.tx.clone(), &self.cancel);

        if let Err(err) = self.drain().await {
            tracing::error!(error = %err, "aborting run");
            self.cancel.cancel();
            if let Err(flush_err) = self.store.flush() {
                tracing::error!(error = %flush_err, "could not persist plugin store");
            }
            return Err(err);
        }

        self.store.flush()?;
        let mut summary = std::mem::take(&mut self.summary);
        for (result, task_failed) in std::mem::take(&mut self.book).into_sorted() {
            summary.record_final(&result, task_failed);
        }
        tracing::info!(
            downloads = self.downloads.scheduled(),
            store = %self.store.path().display(),
            headline = %summary.headline(),
            "run finished"
        );
        Ok(summary)
    }

    /// Processes completion messages until every check, download and the
    /// premium batch has reported.
    async fn drain(&mut self) -> Result<(), UpdateError> {
        while !self.is_finished() {
            let Some(first) = self.rx.recv().await else {
                break;
            };
            self.update(first)?;

            while let Ok(msg) = self.rx.try_recv() {
                self.update(msg)?;
            }
        }
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.checks_done == self.expected_checks
            && self.downloads.in_flight() == 0
            && self.session_done
    }

    fn update(&mut self, msg: Msg) -> Result<(), UpdateError> {
        match msg {
            Msg::Checked(result) => self.handle_checked(result)?,
            Msg::TaskFinished(report) => self.handle_task_finished(report)?,
            Msg::SessionFinished(outcome) => self.handle_session_finished(outcome),
        }

        if self.checks_done == self.expected_checks && !self.session_started {
            self.start_session();
        }
        Ok(())
    }

    fn handle_checked(&mut self, result: CheckResult) -> Result<(), UpdateError> {
        self.checks_done += 1;
        self.summary.checked += 1;
        let name = result.name().to_string();

        if let Some(ids) = &result.ids {
            self.store.backfill_ids(&name, ids)?;
        }
        if result.premium && !result.plugin.premium {
            self.store.write_back(&name, RecordField::Premium(true))?;
        }

        let decision = triage(&result, self.config.general.profile);
        if let Some(latest) = &decision.write_latest {
            self.store
                .write_back(&name, RecordField::LatestVersion(latest.clone()))?;
        }
        // persisted before any download starts
        self.store.flush()?;

        if result.code() == ResultCode::UpdateAvailable {
            self.summary.updates_available += 1;
        }

        match decision.disposition {
            Disposition::UpToDate => self.summary.up_to_date += 1,
            Disposition::Warn(message) => {
                if result.code() == ResultCode::ProviderError {
                    self.summary.errors += 1;
                }
                tracing::warn!(plugin = %name, code = result.code().label(), %message, "check needs attention");
                self.summary.warnings.push(Warning::plugin(&name, message));
            }
            Disposition::Notify(line) => {
                tracing::info!(plugin = %name, "update available");
                self.summary.notices.push(line);
            }
            Disposition::Update(route) => match DownloadJob::from_result(&result) {
                Some(job) => match route {
                    Route::Parallel => self.downloads.schedule(job),
                    Route::Exclusive => {
                        tracing::info!(plugin = %name, "queued for premium session");
                        self.premium_pending.insert(name.clone());
                        self.premium_queue.push(job);
                    }
                },
                None => self
                    .summary
                    .warnings
                    .push(Warning::plugin(&name, "update has no download url")),
            },
        }

        self.book.insert(result);
        Ok(())
    }

    fn handle_task_finished(&mut self, report: TaskReport) -> Result<(), UpdateError> {
        if !self.premium_pending.remove(&report.plugin) {
            self.downloads.finished();
        }

        let code = self.book.apply(&report).inspect_err(|err| {
            tracing::error!(error = %err, "task correlation failed");
        })?;

        if report.state == TaskState::Failed {
            self.summary.errors += 1;
            let cause = report
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown cause".to_string());
            self.summary
                .warnings
                .push(Warning::plugin(&report.plugin, format!("update failed: {cause}")));
        } else {
            tracing::info!(
                plugin = %report.plugin,
                code = code.label(),
                bytes = report.bytes,
                artifact = ?report.artifact,
                "update finished"
            );
        }
        Ok(())
    }

    /// Starts the premium batch once every check has been triaged. Runs
    /// alongside the ordinary downloads still in flight.
    fn start_session(&mut self) {
        self.session_started = true;
        if self.premium_queue.is_empty() {
            self.session_done = true;
            return;
        }

        let manager = SessionManager::new(
            Arc::clone(&self.collaborators.sessions),
            self.config.credentials(),
            self.config.session_state_path(),
            installer_for(&self.config),
            self.cancel.clone(),
        );
        let queue = std::mem::take(&mut self.premium_queue);
        let tx = self.tx.clone();
        tracing::info!(queued = queue.len(), "starting premium session");

        tokio::spawn(async move {
            let outcome = manager.run(queue, tx.clone()).await;
            if tx.send(Msg::SessionFinished(outcome)).is_err() {
                tracing::debug!("run loop gone, dropping session outcome");
            }
        });
    }

    fn handle_session_finished(&mut self, outcome: SessionOutcome) {
        self.session_done = true;
        tracing::info!(processed = outcome.processed, phase = ?outcome.phase, "premium session finished");
        self.summary.warnings.extend(outcome.warnings);
        if let Some(err) = outcome.auth_error {
            self.summary
                .warnings
                .push(Warning::general(format!("premium updates skipped: {err}")));
            self.summary.auth_failure = Some(err);
        }
    }
}

fn installer_for(config: &AppConfig) -> Installer {
    Installer::new(
        config.general.profile,
        config.downloads_dir(),
        config.plugins_dir(),
        config.general.versioned_file_names,
    )
}
