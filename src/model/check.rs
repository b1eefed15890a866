use std::sync::Arc;

use crate::model::record::{PluginRecord, ProviderIds};
use crate::model::version;
use crate::plugin::checker::{CheckError, CheckOutcome, Lookup};

/// Outcome of one version check, later advanced by its download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    UpToDate,
    UpdateAvailable,
    ProviderError,
    NotFound,
    Downloaded,
    Installed,
}

impl ResultCode {
    pub fn label(&self) -> &'static str {
        match self {
            ResultCode::UpToDate => "UP_TO_DATE",
            ResultCode::UpdateAvailable => "UPDATE_AVAILABLE",
            ResultCode::ProviderError => "PROVIDER_ERROR",
            ResultCode::NotFound => "NOT_FOUND",
            ResultCode::Downloaded => "DOWNLOADED",
            ResultCode::Installed => "INSTALLED",
        }
    }
}

/// What kind of artifact a provider offers for the latest release.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DownloadType {
    /// A direct `.jar` archive.
    Jar,
    /// Hosted elsewhere; the provider redirects to it.
    External,
    /// Anything else, e.g. `.zip`.
    Other(String),
    #[default]
    Unknown,
}

impl DownloadType {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "" | "unknown" => DownloadType::Unknown,
            ".jar" | "jar" => DownloadType::Jar,
            "external" => DownloadType::External,
            _ => DownloadType::Other(raw.to_string()),
        }
    }

    pub fn is_supported(&self) -> bool {
        matches!(self, DownloadType::Jar | DownloadType::External)
    }

    pub fn label(&self) -> &str {
        match self {
            DownloadType::Jar => ".jar",
            DownloadType::External => "external",
            DownloadType::Other(raw) => raw,
            DownloadType::Unknown => "unknown",
        }
    }
}

/// Result of checking one included plugin.
///
/// `latest_version` is set iff the code is one of `UPDATE_AVAILABLE`,
/// `DOWNLOADED`, `INSTALLED`. The constructors and the `mark_*` transitions
/// are the only way to change the code, which keeps that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub plugin: Arc<PluginRecord>,
    code: ResultCode,
    latest_version: Option<String>,
    pub download_url: Option<String>,
    pub download_type: DownloadType,
    pub ids: Option<ProviderIds>,
    pub premium: bool,
    pub error: Option<CheckError>,
}

impl CheckResult {
    pub fn from_outcome(plugin: Arc<PluginRecord>, outcome: CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::Found(lookup) => Self::from_lookup(plugin, lookup),
            CheckOutcome::NotFound => Self::not_found(plugin),
        }
    }

    pub fn from_lookup(plugin: Arc<PluginRecord>, lookup: Lookup) -> Self {
        let newer = version::is_newer(plugin.declared_version(), &lookup.latest_version);
        let (code, latest_version) = if newer {
            (ResultCode::UpdateAvailable, Some(lookup.latest_version))
        } else {
            (ResultCode::UpToDate, None)
        };

        Self {
            plugin,
            code,
            latest_version,
            download_url: lookup.download_url,
            download_type: lookup.download_type,
            ids: Some(lookup.ids),
            premium: lookup.premium,
            error: None,
        }
    }

    pub fn not_found(plugin: Arc<PluginRecord>) -> Self {
        Self::empty(plugin, ResultCode::NotFound, None)
    }

    pub fn provider_error(plugin: Arc<PluginRecord>, cause: CheckError) -> Self {
        Self::empty(plugin, ResultCode::ProviderError, Some(cause))
    }

    fn empty(plugin: Arc<PluginRecord>, code: ResultCode, error: Option<CheckError>) -> Self {
        Self {
            plugin,
            code,
            latest_version: None,
            download_url: None,
            download_type: DownloadType::Unknown,
            ids: None,
            premium: false,
            error,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn latest_version(&self) -> Option<&str> {
        self.latest_version.as_deref()
    }

    /// Premium either because the provider says so or because the store
    /// remembered it from an earlier run.
    pub fn is_premium(&self) -> bool {
        self.premium || self.plugin.premium
    }

    /// Returns `false` (and leaves the code alone) unless an update was
    /// available.
    pub fn mark_downloaded(&mut self) -> bool {
        if self.code != ResultCode::UpdateAvailable {
            return false;
        }
        self.code = ResultCode::Downloaded;
        true
    }

    pub fn mark_installed(&mut self) -> bool {
        if !matches!(
            self.code,
            ResultCode::UpdateAvailable | ResultCode::Downloaded
        ) {
            return false;
        }
        self.code = ResultCode::Installed;
        true
    }
}
