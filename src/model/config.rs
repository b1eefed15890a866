use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::model::profile::{Concurrency, Profile};
use crate::plugin::session::Credentials;

const PLACEHOLDER_USERNAME: &str = "INSERT_USERNAME_HERE";
const PLACEHOLDER_PASSWORD: &str = "INSERT_PASSWORD_HERE";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub paths: PathsConfig,
    pub spigot: SpigotConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneralConfig {
    pub profile: Profile,
    pub concurrency: Concurrency,
    pub keep_removed: bool,
    pub check_timeout_secs: u64,
    pub max_parallel_checks: usize,
    pub max_parallel_downloads: usize,
    pub versioned_file_names: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathsConfig {
    pub plugins_dir: String,
    pub data_dir: String,
}

#[derive(Clone, Deserialize)]
pub struct SpigotConfig {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SpigotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpigotConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AppConfig {
    /// Load configuration with layering: defaults → user config.
    ///
    /// The user config is `$PLUGIN_UPDATER_CONFIG` when set, otherwise
    /// `config.toml` in the platform config directory.
    pub fn load() -> Result<Self> {
        let user_path = std::env::var_os("PLUGIN_UPDATER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| {
                directories::ProjectDirs::from("", "", "plugin-updater")
                    .map(|dirs| dirs.config_dir().join("config.toml"))
            });

        Self::load_from(user_path.as_deref())
    }

    pub fn load_from(user_path: Option<&Path>) -> Result<Self> {
        let user = match user_path {
            Some(path) if path.exists() => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
            ),
            _ => None,
        };

        Self::from_layers(user.as_deref())
    }

    /// Deep-merges `user` over the compiled-in defaults.
    pub fn from_layers(user: Option<&str>) -> Result<Self> {
        let defaults = include_str!("../../config/default.toml");
        let mut merged: toml::Value = toml::from_str(defaults)?;

        if let Some(user) = user {
            let user: toml::Value = toml::from_str(user).context("invalid user config")?;
            merge_values(&mut merged, user);
        }

        let mut config: AppConfig = merged.try_into()?;

        config.paths.plugins_dir = expand_tilde(&config.paths.plugins_dir)?;
        config.paths.data_dir = expand_tilde(&config.paths.data_dir)?;

        Ok(config)
    }

    pub fn plugins_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.plugins_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        if !self.paths.data_dir.trim().is_empty() {
            return PathBuf::from(&self.paths.data_dir);
        }

        directories::ProjectDirs::from("", "", "plugin-updater")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".plugin-updater"))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.data_dir().join("downloads")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join("plugins.toml")
    }

    pub fn manifest_index(&self) -> PathBuf {
        self.data_dir().join("installed.toml")
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.data_dir().join("session.json")
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.general.check_timeout_secs.max(1))
    }

    /// Spigot credentials, unless they are still the placeholders.
    pub fn credentials(&self) -> Option<Credentials> {
        let username = self.spigot.username.trim();
        let password = self.spigot.password.as_str();
        if username.is_empty()
            || password.is_empty()
            || username == PLACEHOLDER_USERNAME
            || password == PLACEHOLDER_PASSWORD
        {
            return None;
        }

        Some(Credentials::new(username, password))
    }
}

fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn expand_tilde(path: &str) -> Result<String> {
    if !path.starts_with('~') {
        return Ok(path.to_string());
    }

    let home = directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or_else(|| anyhow!("cannot determine home directory"))?;
    Ok(path.replacen('~', &home.to_string_lossy(), 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let config = AppConfig::from_layers(None).unwrap();
        assert_eq!(config.general.profile, Profile::Automatic);
        assert_eq!(config.general.concurrency, Concurrency::Parallel);
        assert!(config.general.keep_removed);
        assert_eq!(config.check_timeout(), Duration::from_secs(30));
        assert!(config.credentials().is_none());
    }

    #[test]
    fn user_layer_overrides_single_keys() {
        let config = AppConfig::from_layers(Some(
            r#"
            [general]
            profile = "NOTIFY"

            [spigot]
            username = "steve"
            password = "hunter2"
            "#,
        ))
        .unwrap();

        assert_eq!(config.general.profile, Profile::Notify);
        // untouched keys still come from the defaults
        assert_eq!(config.general.max_parallel_downloads, 4);
        assert_eq!(config.paths.plugins_dir, "plugins");
        let credentials = config.credentials().unwrap();
        assert_eq!(credentials.username, "steve");
    }

    #[test]
    fn explicit_data_dir_drives_derived_paths() {
        let config = AppConfig::from_layers(Some(
            r#"
            [paths]
            data-dir = "/srv/updater"
            "#,
        ))
        .unwrap();

        assert_eq!(config.store_path(), PathBuf::from("/srv/updater/plugins.toml"));
        assert_eq!(config.downloads_dir(), PathBuf::from("/srv/updater/downloads"));
    }

    #[test]
    fn missing_user_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.general.profile, Profile::Automatic);
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = AppConfig::from_layers(None).unwrap();
        let rendered = format!("{:?}", config.spigot);
        assert!(!rendered.contains(PLACEHOLDER_PASSWORD));
    }
}
