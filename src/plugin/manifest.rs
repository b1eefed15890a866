use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest index {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest index {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// What an installed jar declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default, rename = "spigot-id")]
    pub spigot_id: Option<u32>,
    #[serde(default, rename = "bukkit-id")]
    pub bukkit_id: Option<u32>,
    pub path: PathBuf,
}

impl PluginManifest {
    /// `author` wins; otherwise the first non-blank entry of `authors`.
    pub fn primary_author(&self) -> Option<&str> {
        self.author
            .as_deref()
            .into_iter()
            .chain(self.authors.iter().map(String::as_str))
            .map(str::trim)
            .find(|a| !a.is_empty())
    }
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<PluginManifest>, ManifestError>;
}

#[derive(Debug, Default, Deserialize)]
struct ManifestIndex {
    #[serde(default)]
    plugin: Vec<PluginManifest>,
}

/// Reads `[[plugin]]` entries from an index file. Relative jar paths are
/// resolved against the plugins directory.
#[derive(Debug, Clone)]
pub struct IndexManifestSource {
    index: PathBuf,
    plugins_dir: PathBuf,
}

impl IndexManifestSource {
    pub fn new(index: impl Into<PathBuf>, plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            index: index.into(),
            plugins_dir: plugins_dir.into(),
        }
    }

    fn parse(&self, raw: &str) -> Result<Vec<PluginManifest>, ManifestError> {
        let index: ManifestIndex = toml::from_str(raw).map_err(|source| ManifestError::Parse {
            path: self.index.clone(),
            source,
        })?;

        Ok(index
            .plugin
            .into_iter()
            .map(|mut manifest| {
                manifest.path = resolve(&self.plugins_dir, &manifest.path);
                manifest
            })
            .collect())
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[async_trait]
impl ManifestSource for IndexManifestSource {
    async fn discover(&self) -> Result<Vec<PluginManifest>, ManifestError> {
        let raw = match tokio::fs::read_to_string(&self.index).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(index = %self.index.display(), "no manifest index, nothing installed");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ManifestError::Read {
                    path: self.index.clone(),
                    source,
                });
            }
        };

        let manifests = self.parse(&raw)?;
        tracing::debug!(count = manifests.len(), "discovered installed plugins");
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_index_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("installed.toml");
        std::fs::write(
            &index,
            r#"
            [[plugin]]
            name = "Essentials"
            version = "2.19.0"
            authors = ["", "md_5"]
            spigot-id = 9089
            path = "Essentials.jar"

            [[plugin]]
            name = "Abs"
            path = "/opt/server/plugins/Abs.jar"
            "#,
        )
        .unwrap();

        let source = IndexManifestSource::new(&index, "/srv/plugins");
        let manifests = source.discover().await.unwrap();

        assert_eq!(manifests.len(), 2);
        assert_eq!(manifests[0].path, PathBuf::from("/srv/plugins/Essentials.jar"));
        assert_eq!(manifests[0].primary_author(), Some("md_5"));
        assert_eq!(manifests[0].spigot_id, Some(9089));
        assert_eq!(manifests[1].path, PathBuf::from("/opt/server/plugins/Abs.jar"));
        assert_eq!(manifests[1].primary_author(), None);
    }

    #[tokio::test]
    async fn missing_index_means_nothing_installed() {
        let dir = tempfile::tempdir().unwrap();
        let source = IndexManifestSource::new(dir.path().join("absent.toml"), dir.path());
        assert!(source.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("installed.toml");
        std::fs::write(&index, "[[plugin]]\nname = 3\n").unwrap();

        let err = IndexManifestSource::new(&index, dir.path())
            .discover()
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }
}
