//! Version-check providers backed by public plugin APIs.
//!
//! Each provider turns a [`PluginRecord`] into a [`CheckOutcome`]. HTTP and
//! response-shape failures become [`CheckError`]s; a provider that answers
//! but does not know the plugin yields [`CheckOutcome::NotFound`].

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{StatusCode, Url};
use serde_json::Value;

use crate::model::check::DownloadType;
use crate::model::record::{PluginRecord, ProviderIds};
use crate::plugin::checker::{CheckError, CheckOutcome, Lookup, VersionChecker};

const SPIGET_API: &str = "https://api.spiget.org/v2";
const SPIGOT_SITE: &str = "https://www.spigotmc.org";
const SERVERMODS_API: &str = "https://api.curseforge.com/servermods";
/// Search hits whose author is looked up before giving up.
const SEARCH_CANDIDATES: usize = 10;

static FILE_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.][^.]+$").expect("valid file extension regex"));

/// Shared HTTP client for all providers.
pub fn http_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("plugin-updater/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .build()
}

/// Fetches JSON, mapping 404 to `None`.
async fn get_json(client: &reqwest::Client, url: &str) -> Result<Option<Value>, CheckError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| CheckError::http(url, e))?;

    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }

    let response = response
        .error_for_status()
        .map_err(|e| CheckError::http(url, e))?;
    let json = response
        .json::<Value>()
        .await
        .map_err(|e| CheckError::parse(url, e.to_string()))?;
    Ok(Some(json))
}

pub struct SpigotChecker {
    client: reqwest::Client,
}

impl SpigotChecker {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionChecker for SpigotChecker {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
        let Some(id) = record.ids.spigot else {
            return Ok(CheckOutcome::NotFound);
        };

        let versions_url = format!("{SPIGET_API}/resources/{id}/versions?size=1&sort=-releaseDate");
        tracing::debug!(plugin = record.name(), url = %versions_url, "fetching latest release");
        let Some(versions) = get_json(&self.client, &versions_url).await? else {
            return Ok(CheckOutcome::NotFound);
        };
        let latest_version = parse_spiget_latest(&versions_url, &versions)?;

        let details_url = format!("{SPIGET_API}/resources/{id}");
        tracing::debug!(plugin = record.name(), url = %details_url, "fetching resource details");
        let Some(details) = get_json(&self.client, &details_url).await? else {
            return Ok(CheckOutcome::NotFound);
        };
        let (download_type, premium) = parse_spiget_details(&details_url, &details)?;

        Ok(CheckOutcome::Found(Lookup {
            latest_version,
            download_url: Some(spigot_download_url(id, premium)),
            download_type,
            ids: ProviderIds {
                spigot: Some(id),
                bukkit: None,
            },
            premium,
        }))
    }
}

/// Premium resources can only be fetched from the site with a logged-in
/// session; everything else goes through the spiget mirror.
pub fn spigot_download_url(id: u32, premium: bool) -> String {
    if premium {
        format!("{SPIGOT_SITE}/resources/{id}/download")
    } else {
        format!("{SPIGET_API}/resources/{id}/download")
    }
}

fn parse_spiget_latest(url: &str, json: &Value) -> Result<String, CheckError> {
    json.get(0)
        .and_then(|v| v.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CheckError::parse(url, "no release name in version list"))
}

fn parse_spiget_details(url: &str, json: &Value) -> Result<(DownloadType, bool), CheckError> {
    let file_type = json
        .get("file")
        .and_then(|f| f.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| CheckError::parse(url, "missing file.type"))?;

    // spiget reports `premium` as a bool, older mirrors as a string
    let premium = match json.get("premium") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    };

    Ok((DownloadType::parse(file_type), premium))
}

pub struct BukkitChecker {
    client: reqwest::Client,
}

impl BukkitChecker {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionChecker for BukkitChecker {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
        let Some(id) = record.ids.bukkit else {
            return Ok(CheckOutcome::NotFound);
        };

        let url = format!("{SERVERMODS_API}/files?projectIds={id}");
        tracing::debug!(plugin = record.name(), url = %url, "fetching latest release");
        let Some(files) = get_json(&self.client, &url).await? else {
            return Ok(CheckOutcome::NotFound);
        };

        match parse_servermods_files(&url, &files)? {
            Some(mut lookup) => {
                lookup.ids.bukkit = Some(id);
                Ok(CheckOutcome::Found(lookup))
            }
            None => Ok(CheckOutcome::NotFound),
        }
    }
}

/// The newest file is the last entry of the list.
fn parse_servermods_files(url: &str, json: &Value) -> Result<Option<Lookup>, CheckError> {
    let files = json
        .as_array()
        .ok_or_else(|| CheckError::parse(url, "expected a list of files"))?;
    let Some(latest) = files.last() else {
        return Ok(None);
    };

    let field = |key: &str| {
        latest
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| CheckError::parse(url, format!("missing '{key}'")))
    };

    let file_name = field("fileName")?;
    let extension = FILE_EXT_RE
        .find(file_name)
        .ok_or_else(|| CheckError::parse(url, format!("no file type in '{file_name}'")))?;

    Ok(Some(Lookup {
        latest_version: field("name")?.to_string(),
        download_url: Some(field("downloadUrl")?.to_string()),
        download_type: DownloadType::parse(extension.as_str()),
        ids: ProviderIds::default(),
        premium: false,
    }))
}

/// Finds the spigot resource of a plugin that has no id yet by searching
/// its name and matching the resource author against the declared one.
/// The resolved id comes back in the lookup so it can be persisted.
pub struct SpigotSearchChecker {
    client: reqwest::Client,
    by_id: SpigotChecker,
}

impl SpigotSearchChecker {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            by_id: SpigotChecker::new(client.clone()),
            client,
        }
    }

    async fn resolve_id(&self, name: &str, author: &str) -> Result<Option<u32>, CheckError> {
        let url = spiget_search_url(name)?;
        tracing::debug!(plugin = name, url = %url, "searching spigot by name");
        let Some(results) = get_json(&self.client, &url).await? else {
            return Ok(None);
        };

        let mut hits = parse_spiget_search(&url, &results)?;
        // exact title matches first, otherwise keep the api's ranking
        hits.sort_by_key(|hit| !hit.name.trim().eq_ignore_ascii_case(name));

        let mut authors: HashMap<u32, String> = HashMap::new();
        for hit in hits.into_iter().take(SEARCH_CANDIDATES) {
            if !authors.contains_key(&hit.author_id) {
                let author_url = format!("{SPIGET_API}/authors/{}", hit.author_id);
                let Some(json) = get_json(&self.client, &author_url).await? else {
                    continue;
                };
                authors.insert(hit.author_id, parse_spiget_author(&author_url, &json)?);
            }
            if authors
                .get(&hit.author_id)
                .is_some_and(|found| same_author(author, found))
            {
                return Ok(Some(hit.id));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl VersionChecker for SpigotSearchChecker {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
        let Some(author) = record.declared_author() else {
            return Ok(CheckOutcome::NotFound);
        };
        let Some(id) = self.resolve_id(record.name(), author).await? else {
            tracing::debug!(plugin = record.name(), author, "no spigot resource by that author");
            return Ok(CheckOutcome::NotFound);
        };

        tracing::info!(plugin = record.name(), spigot_id = id, "resolved spigot id by search");
        let mut resolved = record.clone();
        resolved.ids.spigot = Some(id);
        self.by_id.check(&resolved).await
    }
}

fn spiget_search_url(name: &str) -> Result<String, CheckError> {
    let mut url = Url::parse(SPIGET_API).map_err(|e| CheckError::parse(SPIGET_API, e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| CheckError::parse(SPIGET_API, "api url cannot take a path"))?
        .extend(["search", "resources", name]);
    url.query_pairs_mut()
        .append_pair("field", "name")
        .append_pair("size", "25");
    Ok(url.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchHit {
    id: u32,
    name: String,
    author_id: u32,
}

/// Entries without an id or author are skipped.
fn parse_spiget_search(url: &str, json: &Value) -> Result<Vec<SearchHit>, CheckError> {
    let entries = json
        .as_array()
        .ok_or_else(|| CheckError::parse(url, "expected a list of resources"))?;

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let id = entry.get("id").and_then(Value::as_u64)?;
            let author_id = entry
                .get("author")
                .and_then(|a| a.get("id"))
                .and_then(Value::as_u64)?;
            Some(SearchHit {
                id: u32::try_from(id).ok()?,
                name: entry
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                author_id: u32::try_from(author_id).ok()?,
            })
        })
        .collect())
}

fn parse_spiget_author(url: &str, json: &Value) -> Result<String, CheckError> {
    json.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CheckError::parse(url, "author without a name"))
}

/// Declared authors often differ from the account name in case or spacing.
fn same_author(declared: &str, found: &str) -> bool {
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    };
    squash(declared) == squash(found)
}

/// Reads a user-hosted JSON document:
/// `{ "version": "1.2.3", "download-url": "https://..." }`.
pub struct CustomUrlChecker {
    client: reqwest::Client,
}

impl CustomUrlChecker {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VersionChecker for CustomUrlChecker {
    async fn check(&self, record: &PluginRecord) -> Result<CheckOutcome, CheckError> {
        let Some(url) = record.custom_check_url() else {
            return Ok(CheckOutcome::NotFound);
        };

        tracing::debug!(plugin = record.name(), url, "fetching custom check url");
        let Some(json) = get_json(&self.client, url).await? else {
            return Ok(CheckOutcome::NotFound);
        };

        parse_custom_document(url, &json).map(CheckOutcome::Found)
    }
}

fn parse_custom_document(url: &str, json: &Value) -> Result<Lookup, CheckError> {
    let latest_version = ["version", "latest-version", "latest_version"]
        .iter()
        .find_map(|key| json.get(*key).and_then(Value::as_str))
        .ok_or_else(|| CheckError::parse(url, "missing 'version'"))?;

    let download_url = ["download-url", "download_url", "url"]
        .iter()
        .find_map(|key| json.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    let download_type = match download_url.as_deref() {
        Some(link) => FILE_EXT_RE
            .find(link.split(['?', '#']).next().unwrap_or(link))
            .map(|ext| DownloadType::parse(ext.as_str()))
            .filter(DownloadType::is_supported)
            .unwrap_or(DownloadType::External),
        None => DownloadType::Unknown,
    };

    Ok(Lookup {
        latest_version: latest_version.to_string(),
        download_url,
        download_type,
        ids: ProviderIds::default(),
        premium: false,
    })
}
