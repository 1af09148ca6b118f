use crate::config::ArchiveSettings;
use crate::error::ArchiveError;
use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const TORRENT_EXTENSION: &str = ".torrent";

/// Best-effort descriptive fields of one item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// One downloadable file of an item, as listed by the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub name: String,
    pub size: Option<u64>,
    pub md5: Option<String>,
    /// Generated by the archive (derivative or metadata file) rather than uploaded.
    pub derived: bool,
}

impl RemoteFile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
            md5: None,
            derived: false,
        }
    }

    pub fn is_torrent(&self) -> bool {
        self.name.ends_with(TORRENT_EXTENSION)
    }
}

/// The remote content archive, seen from the downloader.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Every item identifier belonging to `collection`, fully enumerated.
    async fn list_items(&self, collection: &str) -> Result<Vec<String>, ArchiveError>;

    async fn item_metadata(&self, identifier: &str) -> Result<ItemMetadata, ArchiveError>;

    async fn list_files(&self, identifier: &str) -> Result<Vec<RemoteFile>, ArchiveError>;

    /// Transfers one file to `destination`, creating parent directories as needed.
    async fn fetch_file(
        &self,
        identifier: &str,
        file: &RemoteFile,
        destination: &Path,
        verbose: bool,
    ) -> Result<(), ArchiveError>;
}

/// Maps an archive file name onto a relative path, rejecting anything that
/// could escape the directory it is joined onto.
pub fn safe_relative_path(name: &str) -> Result<PathBuf, ArchiveError> {
    let path = Path::new(name);
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            _ => return Err(ArchiveError::UnsafeName(name.to_string())),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafeName(name.to_string()));
    }
    Ok(relative)
}

#[derive(Debug, Deserialize)]
struct ScrapePage {
    #[serde(default)]
    items: Vec<ScrapeItem>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScrapeItem {
    identifier: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataResponse {
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    name: String,
    #[serde(default)]
    size: Option<Value>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

impl From<FileEntry> for RemoteFile {
    fn from(entry: FileEntry) -> Self {
        let size = match entry.size {
            Some(Value::String(s)) => s.trim().parse().ok(),
            Some(Value::Number(n)) => n.as_u64(),
            _ => None,
        };
        Self {
            name: entry.name,
            size,
            md5: entry.md5.filter(|m| !m.is_empty()),
            derived: matches!(entry.source.as_deref(), Some("derivative") | Some("metadata")),
        }
    }
}

/// Metadata values are either a string or a list of strings.
fn text_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(parts) => {
            let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// HTTP client for the Internet Archive public APIs.
///
/// Metadata and file listing share one `/metadata` record; the file list from
/// an `item_metadata` call is held until the matching `list_files` takes it.
pub struct IaClient {
    client: Client,
    base_url: Url,
    page_size: usize,
    pending_files: Mutex<HashMap<String, Vec<RemoteFile>>>,
}

impl IaClient {
    pub fn new(settings: &ArchiveSettings) -> Result<Self, ArchiveError> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            ArchiveError::Other(format!("invalid archive URL {}: {}", settings.base_url, e))
        })?;

        // Transfers have no overall deadline; only connecting is bounded.
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .build()
            .map_err(|source| ArchiveError::Http {
                url: settings.base_url.clone(),
                source,
            })?;

        Ok(Self {
            client,
            base_url,
            page_size: settings.page_size.max(1),
            pending_files: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, ArchiveError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ArchiveError::Other(format!("archive URL {} cannot be a base", self.base_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder, url: &Url) -> Result<Response, ArchiveError> {
        let response = request.send().await.map_err(|source| ArchiveError::Http {
            url: url.to_string(),
            source,
        })?;

        if !response.status().is_success() {
            return Err(ArchiveError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &Url,
    ) -> Result<T, ArchiveError> {
        let response = self.send(request, url).await?;
        let body = response.bytes().await.map_err(|source| ArchiveError::Http {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|e| ArchiveError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    async fn item_record(&self, identifier: &str) -> Result<MetadataResponse, ArchiveError> {
        let url = self.endpoint(["metadata", identifier])?;
        self.get_json(self.client.get(url.clone()), &url).await
    }
}

#[async_trait]
impl Archive for IaClient {
    async fn list_items(&self, collection: &str) -> Result<Vec<String>, ArchiveError> {
        let url = self.endpoint(["services", "search", "v1", "scrape"])?;
        let query = format!("collection:{}", collection);
        let count = self.page_size.to_string();

        let mut identifiers = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut request = self.client.get(url.clone()).query(&[
                ("q", query.as_str()),
                ("fields", "identifier"),
                ("count", count.as_str()),
            ]);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }

            let page: ScrapePage = self.get_json(request, &url).await?;
            debug!(
                "Listed {} items from '{}' (cursor: {:?})",
                page.items.len(),
                collection,
                cursor
            );
            identifiers.extend(page.items.into_iter().map(|item| item.identifier));

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(identifiers)
    }

    async fn item_metadata(&self, identifier: &str) -> Result<ItemMetadata, ArchiveError> {
        let record = self.item_record(identifier).await?;
        let metadata = ItemMetadata {
            title: text_value(record.metadata.get("title")),
            description: text_value(record.metadata.get("description")),
        };
        let files = record.files.into_iter().map(RemoteFile::from).collect();
        self.pending_files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identifier.to_string(), files);
        Ok(metadata)
    }

    async fn list_files(&self, identifier: &str) -> Result<Vec<RemoteFile>, ArchiveError> {
        let cached = self
            .pending_files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(identifier);
        if let Some(files) = cached {
            return Ok(files);
        }
        let record = self.item_record(identifier).await?;
        Ok(record.files.into_iter().map(RemoteFile::from).collect())
    }

    async fn fetch_file(
        &self,
        identifier: &str,
        file: &RemoteFile,
        destination: &Path,
        verbose: bool,
    ) -> Result<(), ArchiveError> {
        safe_relative_path(&file.name)?;
        let url = self.endpoint(["download", identifier].into_iter().chain(file.name.split('/')))?;
        let response = self.send(self.client.get(url.clone()), &url).await?;

        let io_err = |source| ArchiveError::Io {
            path: destination.to_path_buf(),
            source,
        };
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut out = tokio::fs::File::create(destination).await.map_err(io_err)?;

        let total = response.content_length().or(file.size).unwrap_or(0);
        let pb = if !verbose {
            ProgressBar::hidden()
        } else if total > 0 {
            let pb = ProgressBar::new(total);
            pb.set_style(
                ProgressStyle::with_template(
                    "{prefix:.bold.dim} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({binary_bytes_per_sec}) {msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
            );
            pb
        } else {
            ProgressBar::new_spinner()
        };
        pb.set_prefix(format!("[{}]", file.name));

        let mut ctx = md5::Context::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| ArchiveError::Http {
                url: url.to_string(),
                source,
            })?;
            ctx.consume(&chunk);
            out.write_all(&chunk).await.map_err(io_err)?;
            pb.inc(chunk.len() as u64);
        }
        out.flush().await.map_err(io_err)?;
        pb.finish_and_clear();

        if let Some(expected) = &file.md5 {
            let actual = format!("{:x}", ctx.compute());
            if actual.eq_ignore_ascii_case(expected) {
                return Ok(());
            }
            // Derived files are regenerated in place and often carry a stale md5.
            if file.derived {
                warn!(
                    "⚠️  [{}] md5 mismatch on derived file {} (expected {}, got {}), keeping it",
                    identifier, file.name, expected, actual
                );
            } else {
                return Err(ArchiveError::Checksum {
                    name: file.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}
