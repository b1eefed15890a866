//! Scripted collaborators for unit and scenario tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::check::DownloadType;
use crate::model::record::{PluginRecord, ProviderIds};
use crate::plugin::checker::{CheckError, CheckOutcome, Lookup, VersionChecker};
use crate::plugin::download::{ContentPolicy, DownloadError, DownloadSink, Progress};
use crate::plugin::manifest::{ManifestError, ManifestSource, PluginManifest};
use crate::plugin::session::{AuthError, AuthSession, Credentials, SessionOpener, StoredCookie};

pub fn download_url(latest: &str) -> String {
    format!("https://downloads.invalid/{latest}.jar")
}

pub fn found(latest: &str) -> Script {
    found_at(latest, &download_url(latest))
}

pub fn found_at(latest: &str, url: &str) -> Script {
    Script::Found(Lookup {
        latest_version: latest.to_string(),
        download_url: Some(url.to_string()),
        download_type: DownloadType::Jar,
        ids: ProviderIds::default(),
        premium: false,
    })
}

pub fn premium_at(latest: &str, url: &str) -> Script {
    match found_at(latest, url) {
        Script::Found(mut lookup) => {
            lookup.premium = true;
            Script::Found(lookup)
        }
        other => other,
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Found(Lookup),
    NotFound,
    Fail(CheckError),
    Panic,
    Hang,
    Slow(Duration, Box<Script>),
}

/// Answers each plugin name with its script; unknown names are not found.
#[derive(Debug, Default)]
pub struct ScriptedChecker {
    scripts: HashMap<String, Script>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedChecker {
    pub fn with(mut self, name: &str, script: Script) -> Self {
        self.scripts.insert(name.to_string(), script);
        self
    }

    /// Highest number of checks observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct Active<'a>(&'a AtomicUsize);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl VersionChecker for ScriptedChecker {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = Active(&self.active);
        self.peak.fetch_max(now, Ordering::SeqCst);

        let script = self
            .scripts
            .get(record.name())
            .cloned()
            .unwrap_or(Script::NotFound);
        let script = match script {
            Script::Slow(delay, inner) => {
                tokio::time::sleep(delay).await;
                *inner
            }
            other => other,
        };

        match script {
            Script::Found(lookup) => Ok(CheckOutcome::Found(lookup)),
            Script::NotFound | Script::Slow(..) => Ok(CheckOutcome::NotFound),
            Script::Fail(err) => Err(err),
            Script::Panic => panic!("scripted panic for {}", record.name()),
            Script::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug, Clone)]
struct Served {
    body: Vec<u8>,
    content_type: String,
    failure: Option<DownloadError>,
}

/// Serves canned bodies and records every requested url.
#[derive(Debug)]
pub struct RecordingSink {
    default: Served,
    by_url: HashMap<String, Served>,
    panicking: Vec<String>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn serving(body: &[u8]) -> Self {
        Self {
            default: Served {
                body: body.to_vec(),
                content_type: "application/java-archive".to_string(),
                failure: None,
            },
            by_url: HashMap::new(),
            panicking: Vec::new(),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Writes `partial` to the destination, then fails with `err`.
    pub fn failing_midway(partial: &[u8], err: DownloadError) -> Self {
        let mut sink = Self::serving(partial);
        sink.default.failure = Some(err);
        sink
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_content_type(mut self, url: &str, content_type: &str) -> Self {
        let mut served = self.default.clone();
        served.content_type = content_type.to_string();
        self.by_url.insert(url.to_string(), served);
        self
    }

    /// Writes a partial file for `url` and then panics.
    pub fn panicking_on(mut self, url: &str) -> Self {
        self.panicking.push(url.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DownloadSink for RecordingSink {
    async fn stream(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError> {
        self.calls.lock().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.panicking.iter().any(|u| u == url) {
            tokio::fs::write(dest, b"half").await?;
            panic!("sink blew up on {url}");
        }

        let served = self.by_url.get(url).unwrap_or(&self.default);
        policy.check(Some(served.content_type.as_str()))?;
        tokio::fs::write(dest, &served.body).await?;
        progress.advance(served.body.len() as u64);

        match &served.failure {
            Some(err) => Err(err.clone()),
            None => Ok(served.body.len() as u64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionBehaviour {
    pub open_error: Option<AuthError>,
    pub restore_accepted: bool,
    pub login_accepted: bool,
    pub body: Vec<u8>,
    pub not_owned: Vec<String>,
    pub panic_on: Vec<String>,
    pub fetch_delay: Duration,
}

impl Default for SessionBehaviour {
    fn default() -> Self {
        Self {
            open_error: None,
            restore_accepted: false,
            login_accepted: true,
            body: b"premium build".to_vec(),
            not_owned: Vec::new(),
            panic_on: Vec::new(),
            fetch_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct SessionLog {
    opens: AtomicUsize,
    closes: AtomicUsize,
    restores: AtomicUsize,
    logins: AtomicUsize,
    intervals: Mutex<Vec<(Instant, Instant)>>,
}

/// Opens instrumented sessions. Clones share one log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSessions {
    behaviour: Arc<SessionBehaviour>,
    log: Arc<SessionLog>,
}

impl ScriptedSessions {
    pub fn new(behaviour: SessionBehaviour) -> Self {
        Self {
            behaviour: Arc::new(behaviour),
            log: Arc::default(),
        }
    }

    pub fn opens(&self) -> usize {
        self.log.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.log.closes.load(Ordering::SeqCst)
    }

    pub fn restores(&self) -> usize {
        self.log.restores.load(Ordering::SeqCst)
    }

    pub fn logins(&self) -> usize {
        self.log.logins.load(Ordering::SeqCst)
    }

    /// Start and end of every authenticated fetch, in completion order.
    pub fn fetch_intervals(&self) -> Vec<(Instant, Instant)> {
        self.log.intervals.lock().clone()
    }
}

#[async_trait]
impl SessionOpener for ScriptedSessions {
    async fn open(&self) -> Result<Box<dyn AuthSession>, AuthError> {
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.behaviour.open_error {
            return Err(err.clone());
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl AuthSession for ScriptedSessions {
    async fn restore(&self, _cookies: &[StoredCookie]) -> Result<bool, AuthError> {
        self.log.restores.fetch_add(1, Ordering::SeqCst);
        Ok(self.behaviour.restore_accepted)
    }

    async fn login(&self, _credentials: &Credentials) -> Result<bool, AuthError> {
        self.log.logins.fetch_add(1, Ordering::SeqCst);
        Ok(self.behaviour.login_accepted)
    }

    fn export_cookies(&self) -> Result<Vec<StoredCookie>, AuthError> {
        Ok(["xf_user", "xf_session"]
            .into_iter()
            .map(|name| StoredCookie {
                name: name.to_string(),
                value: "fresh".to_string(),
                domain: "www.spigotmc.org".to_string(),
                path: "/".to_string(),
            })
            .collect())
    }

    async fn fetch_authenticated(
        &self,
        url: &str,
        dest: &Path,
        policy: &ContentPolicy,
        progress: &Progress,
    ) -> Result<u64, DownloadError> {
        let started = Instant::now();
        tokio::time::sleep(self.behaviour.fetch_delay).await;
        if self.behaviour.panic_on.iter().any(|u| u == url) {
            panic!("session blew up on {url}");
        }

        let fetched = if self.behaviour.not_owned.iter().any(|u| u == url) {
            Err(DownloadError::NotOwned {
                url: url.to_string(),
            })
        } else {
            match policy.check(Some("application/octet-stream")) {
                Ok(()) => {
                    tokio::fs::write(dest, &self.behaviour.body).await?;
                    progress.advance(self.behaviour.body.len() as u64);
                    Ok(self.behaviour.body.len() as u64)
                }
                Err(err) => Err(err),
            }
        };

        self.log.intervals.lock().push((started, Instant::now()));
        fetched
    }

    async fn close(&self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixed discovery result.
#[derive(Debug, Clone, Default)]
pub struct StaticManifests(pub Vec<PluginManifest>);

impl StaticManifests {
    pub fn with(mut self, name: &str, version: Option<&str>, author: Option<&str>, path: PathBuf) -> Self {
        self.0.push(PluginManifest {
            name: name.to_string(),
            version: version.map(str::to_string),
            author: author.map(str::to_string),
            path,
            ..PluginManifest::default()
        });
        self
    }
}

#[async_trait]
impl ManifestSource for StaticManifests {
    async fn discover(&self) -> Result<Vec<PluginManifest>, ManifestError> {
        Ok(self.0.clone())
    }
}
