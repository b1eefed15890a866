use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::check::DownloadType;
use crate::model::record::{PluginRecord, ProviderIds};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("unexpected response from {url}: {message}")]
    Parse { url: String, message: String },

    #[error("version check timed out after {0:?}")]
    Timeout(Duration),

    #[error("version check panicked: {0}")]
    Panicked(String),

    #[error("version check cancelled")]
    Cancelled,
}

impl CheckError {
    pub fn http(url: &str, err: impl std::fmt::Display) -> Self {
        Self::Http {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn parse(url: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            url: url.to_string(),
            message: message.into(),
        }
    }
}

/// What a provider knows about the latest release of a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lookup {
    pub latest_version: String,
    pub download_url: Option<String>,
    pub download_type: DownloadType,
    pub ids: ProviderIds,
    pub premium: bool,
}

/// "Not found" is an answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Found(Lookup),
    NotFound,
}

#[async_trait]
pub trait VersionChecker: Send + Sync {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError>;
}

/// Picks the provider for a record: spigot id, then bukkit id, then the
/// custom check url. Records with none of those are searched for by name
/// and author.
pub struct ProviderRouter {
    spigot: Arc<dyn VersionChecker>,
    bukkit: Arc<dyn VersionChecker>,
    custom: Arc<dyn VersionChecker>,
    search: Arc<dyn VersionChecker>,
}

impl ProviderRouter {
    pub fn new(
        spigot: Arc<dyn VersionChecker>,
        bukkit: Arc<dyn VersionChecker>,
        custom: Arc<dyn VersionChecker>,
        search: Arc<dyn VersionChecker>,
    ) -> Self {
        Self {
            spigot,
            bukkit,
            custom,
            search,
        }
    }

    fn provider_for(&self, record: &PluginRecord) -> &Arc<dyn VersionChecker> {
        if record.ids.spigot.is_some() {
            &self.spigot
        } else if record.ids.bukkit.is_some() {
            &self.bukkit
        } else if record.custom_check_url().is_some() {
            &self.custom
        } else {
            &self.search
        }
    }
}

#[async_trait]
impl VersionChecker for ProviderRouter {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
        let outcome = self.provider_for(record).check(record).await?;

        // A static download url configured by the user wins over the provider's.
        Ok(match (outcome, record.custom_download_url()) {
            (CheckOutcome::Found(mut lookup), Some(custom)) => {
                lookup.download_url = Some(custom.to_string());
                if !lookup.download_type.is_supported() {
                    lookup.download_type = DownloadType::Jar;
                }
                CheckOutcome::Found(lookup)
            }
            (outcome, _) => outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl VersionChecker for Fixed {
        async fn check(&self, _record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
            Ok(CheckOutcome::Found(Lookup {
                latest_version: self.0.to_string(),
                download_url: Some(format!("https://{}.invalid/file", self.0)),
                download_type: DownloadType::Unknown,
                ids: ProviderIds::default(),
                premium: false,
            }))
        }
    }

    fn router() -> ProviderRouter {
        ProviderRouter::new(
            Arc::new(Fixed("spigot")),
            Arc::new(Fixed("bukkit")),
            Arc::new(Fixed("custom")),
            Arc::new(Fixed("search")),
        )
    }

    fn latest(outcome: CheckOutcome) -> String {
        match outcome {
            CheckOutcome::Found(lookup) => lookup.latest_version,
            CheckOutcome::NotFound => "not found".into(),
        }
    }

    #[tokio::test]
    async fn spigot_id_takes_precedence() {
        let mut record = PluginRecord::new("Both", "plugins/Both.jar").unwrap();
        record.ids.spigot = Some(1);
        record.ids.bukkit = Some(2);

        assert_eq!(latest(router().check(&record).await.unwrap()), "spigot");

        record.ids.spigot = None;
        assert_eq!(latest(router().check(&record).await.unwrap()), "bukkit");
    }

    #[tokio::test]
    async fn records_without_ids_are_searched_unless_a_check_url_is_set() {
        let mut record = PluginRecord::new("Custom", "plugins/Custom.jar").unwrap();
        assert_eq!(latest(router().check(&record).await.unwrap()), "search");

        record.custom_check_url = Some("https://example.invalid/latest.json".into());
        assert_eq!(latest(router().check(&record).await.unwrap()), "custom");
    }

    #[tokio::test]
    async fn custom_download_url_applies_to_searched_plugins() {
        let mut record = PluginRecord::new("Unlisted", "plugins/Unlisted.jar").unwrap();
        record.custom_download_url = Some("https://mirror.invalid/Unlisted.jar".into());

        let CheckOutcome::Found(lookup) = router().check(&record).await.unwrap() else {
            panic!("expected a lookup");
        };
        assert_eq!(lookup.latest_version, "search");
        assert_eq!(lookup.download_url.as_deref(), Some("https://mirror.invalid/Unlisted.jar"));
    }

    #[tokio::test]
    async fn custom_download_url_overrides_provider_url() {
        let mut record = PluginRecord::new("Pinned", "plugins/Pinned.jar").unwrap();
        record.ids.bukkit = Some(7);
        record.custom_download_url = Some("https://mirror.invalid/Pinned.jar".into());

        let CheckOutcome::Found(lookup) = router().check(&record).await.unwrap() else {
            panic!("expected a lookup");
        };
        assert_eq!(lookup.download_url.as_deref(), Some("https://mirror.invalid/Pinned.jar"));
        assert_eq!(lookup.download_type, DownloadType::Jar);
    }
}
