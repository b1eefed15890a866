//! Persisted per-plugin metadata (`plugins.toml`).
//!
//! All mutation goes through one [`RecordStore`] behind a mutex, so
//! concurrent triage and task completions never lose each other's writes.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::record::{MissingMetadata, PluginRecord, ProviderIds};
use crate::model::summary::Warning;
use crate::plugin::manifest::PluginManifest;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid plugin store {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize plugin store: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no stored record named '{0}'")]
    UnknownPlugin(String),
}

/// One `[plugins.<name>]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StoredPlugin {
    pub exclude: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spigot_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bukkit_id: Option<u32>,
    pub ignore_content_type: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_check_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_download_url: Option<String>,
    pub premium: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    plugins: BTreeMap<String, StoredPlugin>,
}

/// A single field written back during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordField {
    LatestVersion(String),
    SpigotId(u32),
    BukkitId(u32),
    Premium(bool),
}

/// Result of merging discovered plugins with persisted state.
#[derive(Debug, Default)]
pub struct Discovery {
    pub included: usize,
    pub excluded: usize,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<String, StoredPlugin>,
    records: BTreeMap<String, PluginRecord>,
    dirty: bool,
}

#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    keep_removed: bool,
    state: Mutex<StoreState>,
}

impl RecordStore {
    /// Loads the store, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>, keep_removed: bool) -> Result<Self, StoreError> {
        let path = path.into();
        let file = match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<StoreFile>(&raw).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        tracing::debug!(path = %path.display(), entries = file.plugins.len(), "opened plugin store");
        Ok(Self {
            path,
            keep_removed,
            state: Mutex::new(StoreState {
                entries: file.plugins,
                ..StoreState::default()
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merges what is installed now with what was persisted.
    ///
    /// Declared version and author replace stored values, ids declared by
    /// the plugin only fill ids that are still unset, and the exclusion
    /// rule is applied after the merge so a stale `exclude = false` can
    /// never let an unidentifiable plugin through.
    pub fn reconcile(&self, manifests: Vec<PluginManifest>) -> Discovery {
        let mut discovery = Discovery::default();
        let mut state = self.state.lock();
        let mut seen = HashSet::new();
        state.records.clear();

        for manifest in manifests {
            let record = match PluginRecord::new(manifest.name.as_str(), manifest.path.clone()) {
                Ok(record) => record,
                Err(err) => {
                    discovery.warnings.push(Warning::general(err.to_string()));
                    continue;
                }
            };
            let name = record.name().to_string();
            if !seen.insert(name.clone()) {
                tracing::warn!(plugin = %name, path = %manifest.path.display(), "duplicate plugin name");
                discovery.warnings.push(Warning::plugin(
                    &name,
                    format!("duplicate plugin name, ignoring {}", manifest.path.display()),
                ));
                continue;
            }

            let state = &mut *state;
            let is_new = !state.entries.contains_key(&name);
            let entry = state.entries.entry(name.clone()).or_default();
            let before = entry.clone();
            merge_declared(entry, &manifest);
            if is_new || *entry != before {
                state.dirty = true;
            }

            let mut record = record_from_entry(record, entry);
            let missing = record.apply_exclusion_rule();
            if !missing.is_empty() {
                discovery
                    .warnings
                    .push(Warning::plugin(&name, exclusion_message(&missing)));
            }

            if record.excluded {
                tracing::debug!(plugin = %name, "excluded from checks");
                discovery.excluded += 1;
            } else {
                discovery.included += 1;
            }
            state.records.insert(name, record);
        }

        if !self.keep_removed {
            let before = state.entries.len();
            state.entries.retain(|name, _| seen.contains(name));
            if state.entries.len() != before {
                tracing::info!(removed = before - state.entries.len(), "dropped entries of removed plugins");
                state.dirty = true;
            }
        }

        discovery
    }

    pub fn list_included(&self) -> Vec<PluginRecord> {
        self.state
            .lock()
            .records
            .values()
            .filter(|record| !record.excluded)
            .cloned()
            .collect()
    }

    pub fn entry(&self, name: &str) -> Option<StoredPlugin> {
        self.state.lock().entries.get(name).cloned()
    }

    pub fn write_back(&self, name: &str, field: RecordField) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownPlugin(name.to_string()))?;

        let changed = match field {
            RecordField::LatestVersion(version) => replace(&mut entry.latest_version, Some(version)),
            RecordField::SpigotId(id) => replace(&mut entry.spigot_id, Some(id)),
            RecordField::BukkitId(id) => replace(&mut entry.bukkit_id, Some(id)),
            RecordField::Premium(flag) => replace(&mut entry.premium, flag),
        };
        if changed {
            state.dirty = true;
        }
        Ok(())
    }

    /// Fills ids a provider resolved that the store did not know yet.
    pub fn backfill_ids(&self, name: &str, ids: &ProviderIds) -> Result<(), StoreError> {
        let known = self.entry(name).ok_or_else(|| StoreError::UnknownPlugin(name.to_string()))?;
        if let (None, Some(id)) = (known.spigot_id, ids.spigot) {
            self.write_back(name, RecordField::SpigotId(id))?;
        }
        if let (None, Some(id)) = (known.bukkit_id, ids.bukkit) {
            self.write_back(name, RecordField::BukkitId(id))?;
        }
        Ok(())
    }

    /// Writes the store to disk when something changed. The new content
    /// goes to a sibling temp file which is then renamed over the store.
    pub fn flush(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(false);
        }

        let file = StoreFile {
            plugins: state.entries.clone(),
        };
        let rendered = toml::to_string_pretty(&file)?;

        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, rendered).map_err(write_err)?;
        fs::rename(&tmp, &self.path).map_err(write_err)?;

        state.dirty = false;
        tracing::debug!(path = %self.path.display(), "flushed plugin store");
        Ok(true)
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

/// The jar is the source of truth for version and author: a value it no
/// longer declares is cleared rather than kept from an earlier run.
fn merge_declared(entry: &mut StoredPlugin, manifest: &PluginManifest) {
    entry.version = manifest
        .version
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    entry.author = manifest.primary_author().map(str::to_string);
    if entry.spigot_id.is_none() {
        entry.spigot_id = manifest.spigot_id;
    }
    if entry.bukkit_id.is_none() {
        entry.bukkit_id = manifest.bukkit_id;
    }
}

fn record_from_entry(mut record: PluginRecord, entry: &StoredPlugin) -> PluginRecord {
    record.version = entry.version.clone();
    record.author = entry.author.clone();
    record.ids = ProviderIds {
        spigot: entry.spigot_id,
        bukkit: entry.bukkit_id,
    };
    record.custom_check_url = entry.custom_check_url.clone();
    record.custom_download_url = entry.custom_download_url.clone();
    record.excluded = entry.exclude;
    record.ignore_content_type = entry.ignore_content_type;
    record.premium = entry.premium;
    record
}

fn exclusion_message(missing: &[MissingMetadata]) -> String {
    let fields: Vec<&str> = missing
        .iter()
        .map(|m| match m {
            MissingMetadata::Version => "version",
            MissingMetadata::Author => "author",
        })
        .collect();
    format!(
        "excluded: no {} declared and no provider id configured",
        fields.join(" or ")
    )
}
