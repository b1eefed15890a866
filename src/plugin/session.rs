//! The exclusive authenticated session used for premium downloads.
//!
//! One session is opened lazily, authenticated once, and then used for
//! every queued premium update strictly one at a time.
//!
//! Phases: `NoSession → Authenticating → Authenticated → Processing → Closed`.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::model::summary::Warning;
use crate::msg::Msg;
use crate::plugin::download::{ContentPolicy, DownloadError, DownloadSink, Progress};
use crate::plugin::installer::{DownloadJob, Installer, TaskReport};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("premium downloads need spigot credentials, none are configured")]
    MissingCredentials,

    #[error("login rejected: {0}")]
    Rejected(String),

    #[error("session transport failed: {0}")]
    Transport(String),

    #[error("session state unusable: {0}")]
    State(String),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Stable digest of the credentials, persisted next to the cookies so a
    /// change of account invalidates them.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.username.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.password.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// What survives between runs (`session.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub credentials_fingerprint: Option<String>,
    #[serde(default)]
    pub cookies: Vec<StoredCookie>,
}

impl SessionState {
    pub async fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::State(format!("{}: {err}", path.display()))),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| AuthError::State(format!("{}: {err}", path.display())))
    }

    pub async fn save(&self, path: &Path) -> Result<(), AuthError> {
        let state_err = |err: String| AuthError::State(format!("{}: {err}", path.display()));
        let rendered = serde_json::to_vec_pretty(self).map_err(|e| state_err(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| state_err(e.to_string()))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, rendered)
            .await
            .map_err(|e| state_err(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| state_err(e.to_string()))
    }

    fn matches(&self, credentials: Option<&Credentials>) -> bool {
        match (credentials, &self.credentials_fingerprint) {
            (Some(credentials), Some(saved)) => credentials.fingerprint() == *saved,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[async_trait]
pub trait SessionOpener: Send + Sync {
    async fn open(&self) -> Result<Box<dyn AuthSession>, AuthError>;
}

/// A live, stateful session. Only one request runs through it at a time.
#[async_trait]
pub trait AuthSession: Send + Sync {
    /// Reuses saved cookies. `Ok(false)` means they are no longer valid.
    async fn restore(&self, cookies: &[StoredCookie]) -> Result<bool, AuthError>;

    /// Full credential login. `Ok(false)` means the site rejected it.
    async fn login(&self, credentials: &Credentials) -> Result<bool, AuthError>;

    fn export_cookies(&self) -> Result<Vec<StoredCookie>, AuthError>;

    async fn fetch_authenticated(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError>;

    async fn close(&self);
}

/// Lets the installer download through the session like any other sink.
struct SessionSink<'a> {
    session: &'a dyn AuthSession,
}

#[async_trait]
impl DownloadSink for SessionSink<'_> {
    async fn stream(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError> {
        self.session
            .fetch_authenticated(url, dest, policy, progress)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NoSession,
    Authenticating,
    Authenticated,
    Processing,
    Closed,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub phase: SessionPhase,
    pub processed: usize,
    pub warnings: Vec<Warning>,
    pub auth_error: Option<AuthError>,
}

pub struct SessionManager {
    opener: Arc<dyn SessionOpener>,
    credentials: Option<Credentials>,
    state_path: PathBuf,
    installer: Installer,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        opener: Arc<dyn SessionOpener>,
        credentials: Option<Credentials>,
        state_path: impl Into<PathBuf>,
        installer: Installer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            opener,
            credentials,
            state_path: state_path.into(),
            installer,
            cancel,
        }
    }

    /// Processes every queued job and sends one `Msg::TaskFinished` per job.
    pub async fn run(self, queue: Vec<DownloadJob>, tx: UnboundedSender<Msg>) -> SessionOutcome {
        let mut outcome = SessionOutcome {
            phase: SessionPhase::NoSession,
            processed: 0,
            warnings: Vec::new(),
            auth_error: None,
        };
        if queue.is_empty() {
            return outcome;
        }

        transition(&mut outcome.phase, SessionPhase::Authenticating);
        let session = match self.opener.open().await {
            Ok(session) => session,
            Err(err) => {
                self.fail_all(queue, &err, &tx);
                outcome.auth_error = Some(err);
                transition(&mut outcome.phase, SessionPhase::Closed);
                return outcome;
            }
        };

        match self.authenticate(session.as_ref()).await {
            Ok(warnings) => outcome.warnings.extend(warnings),
            Err(err) => {
                session.close().await;
                self.fail_all(queue, &err, &tx);
                outcome.auth_error = Some(err);
                transition(&mut outcome.phase, SessionPhase::Closed);
                return outcome;
            }
        }
        transition(&mut outcome.phase, SessionPhase::Authenticated);

        transition(&mut outcome.phase, SessionPhase::Processing);
        let mut pending: VecDeque<DownloadJob> = queue.into();
        let processing = AssertUnwindSafe(self.process(session.as_ref(), &mut pending, &tx))
            .catch_unwind()
            .await;
        match processing {
            Ok(processed) => outcome.processed = processed,
            Err(_) => {
                tracing::error!(remaining = pending.len(), "premium processing panicked");
                let cause = DownloadError::Session("processing aborted".to_string());
                for job in pending.drain(..) {
                    send(&tx, TaskReport::failed(&job.plugin, cause.clone()));
                }
            }
        }

        session.close().await;
        transition(&mut outcome.phase, SessionPhase::Closed);
        outcome
    }

    async fn process(
        &self,
        session: &dyn AuthSession,
        pending: &mut VecDeque<DownloadJob>,
        tx: &UnboundedSender<Msg>,
    ) -> usize {
        let sink = SessionSink { session };
        let mut processed = 0;
        // A job leaves the queue only once its report is sent.
        while let Some(job) = pending.front() {
            let report = self.installer.run(job, &sink, &self.cancel).await;
            send(tx, report);
            pending.pop_front();
            processed += 1;
        }
        processed
    }

    /// Cheap path first (saved cookies), then a full login. Either way the
    /// refreshed cookies are persisted; failing to persist is only a warning.
    async fn authenticate(&self, session: &dyn AuthSession) -> Result<Vec<Warning>, AuthError> {
        let mut warnings = Vec::new();
        let credentials = self.credentials.as_ref();

        let saved = match SessionState::load(&self.state_path).await {
            Ok(saved) => saved,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring saved session");
                warnings.push(Warning::general(format!("ignoring saved session: {err}")));
                None
            }
        };

        let mut restored = false;
        match saved {
            Some(state) if !state.cookies.is_empty() && state.matches(credentials) => {
                restored = match session.restore(&state.cookies).await {
                    Ok(restored) => restored,
                    Err(err) => {
                        tracing::warn!(error = %err, "restoring saved session failed");
                        false
                    }
                };
                tracing::info!(restored, "tried saved session cookies");
            }
            Some(_) => tracing::info!("saved session belongs to other credentials, logging in"),
            None => tracing::debug!("no saved session"),
        }

        if !restored {
            let credentials = credentials.ok_or(AuthError::MissingCredentials)?;
            if !session.login(credentials).await? {
                return Err(AuthError::Rejected(format!(
                    "credentials for '{}' were not accepted",
                    credentials.username
                )));
            }
            tracing::info!(user = %credentials.username, "logged in");
        }

        match session.export_cookies() {
            Ok(cookies) => {
                let state = SessionState {
                    credentials_fingerprint: credentials.map(Credentials::fingerprint),
                    cookies,
                };
                if let Err(err) = state.save(&self.state_path).await {
                    tracing::warn!(error = %err, "could not persist session");
                    warnings.push(Warning::general(format!("could not persist session: {err}")));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not export session cookies");
                warnings.push(Warning::general(format!("could not export session cookies: {err}")));
            }
        }

        Ok(warnings)
    }

    fn fail_all(&self, queue: Vec<DownloadJob>, err: &AuthError, tx: &UnboundedSender<Msg>) {
        tracing::error!(error = %err, queued = queue.len(), "authentication failed, premium updates skipped");
        let cause = DownloadError::Session(err.to_string());
        for job in queue {
            send(tx, TaskReport::failed(&job.plugin, cause.clone()));
        }
    }
}

fn transition(phase: &mut SessionPhase, next: SessionPhase) {
    tracing::debug!(from = ?phase, to = ?next, "session phase");
    *phase = next;
}

fn send(tx: &UnboundedSender<Msg>, report: TaskReport) {
    if tx.send(Msg::TaskFinished(report)).is_err() {
        tracing::debug!("run loop gone, dropping task report");
    }
}
