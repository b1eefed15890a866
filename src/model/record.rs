use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("the plugin name could not be determined for '{}'", .0.display())]
    MissingName(PathBuf),
}

/// Identifiers under which a plugin is known to update providers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIds {
    pub spigot: Option<u32>,
    pub bukkit: Option<u32>,
}

impl ProviderIds {
    pub fn is_empty(&self) -> bool {
        self.spigot.is_none() && self.bukkit.is_none()
    }
}

/// Identity and resolution state for one installed plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRecord {
    name: String,
    pub version: Option<String>,
    pub author: Option<String>,
    pub ids: ProviderIds,
    pub custom_check_url: Option<String>,
    pub custom_download_url: Option<String>,
    pub excluded: bool,
    pub ignore_content_type: bool,
    pub premium: bool,
    pub path: PathBuf,
}

/// Why a record was excluded from dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingMetadata {
    Version,
    Author,
}

impl PluginRecord {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, RecordError> {
        let name = name.into().trim().to_string();
        let path = path.into();
        if name.is_empty() {
            return Err(RecordError::MissingName(path));
        }

        Ok(Self {
            name,
            version: None,
            author: None,
            ids: ProviderIds::default(),
            custom_check_url: None,
            custom_download_url: None,
            excluded: false,
            ignore_content_type: false,
            premium: false,
            path,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_version(&self) -> Option<&str> {
        non_blank(self.version.as_deref())
    }

    pub fn declared_author(&self) -> Option<&str> {
        non_blank(self.author.as_deref())
    }

    pub fn custom_check_url(&self) -> Option<&str> {
        non_blank(self.custom_check_url.as_deref())
    }

    pub fn custom_download_url(&self) -> Option<&str> {
        non_blank(self.custom_download_url.as_deref())
    }

    /// Metadata a provider lookup cannot do without.
    ///
    /// A resolved provider id is enough to check a plugin, so nothing is
    /// reported missing when one is known.
    pub fn missing_metadata(&self) -> Vec<MissingMetadata> {
        if !self.ids.is_empty() {
            return Vec::new();
        }

        let mut missing = Vec::new();
        if self.declared_version().is_none() {
            missing.push(MissingMetadata::Version);
        }
        if self.declared_author().is_none() {
            missing.push(MissingMetadata::Author);
        }
        missing
    }

    /// Forces `excluded` when required metadata is missing, regardless of
    /// what was persisted before. Returns what was missing.
    pub fn apply_exclusion_rule(&mut self) -> Vec<MissingMetadata> {
        let missing = self.missing_metadata();
        if !missing.is_empty() {
            self.excluded = true;
        }
        missing
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
