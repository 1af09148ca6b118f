//! In-memory archive used by the fetcher and orchestrator tests.

use crate::archive::{Archive, ItemMetadata, RemoteFile};
use crate::error::ArchiveError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockItem {
    metadata: Option<ItemMetadata>,
    files: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct MockArchive {
    collections: HashMap<String, Vec<String>>,
    items: HashMap<String, MockItem>,
    listing_fails: bool,
    fetch_delay: Option<Duration>,
    // (identifier, file name) -> failures left
    failures: Mutex<HashMap<(String, String), u32>>,
    fetched: Mutex<Vec<(String, PathBuf)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: &str, identifiers: &[&str]) -> Self {
        self.collections.insert(
            name.to_string(),
            identifiers.iter().map(|id| id.to_string()).collect(),
        );
        self
    }

    pub fn with_item(mut self, identifier: &str, files: &[(&str, &[u8])]) -> Self {
        let metadata = ItemMetadata {
            title: Some(format!("Title of {}", identifier)),
            description: Some(format!("Description of {}", identifier)),
        };
        self.items.insert(
            identifier.to_string(),
            MockItem {
                metadata: Some(metadata),
                files: files
                    .iter()
                    .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                    .collect(),
            },
        );
        self
    }

    pub fn with_metadata(mut self, identifier: &str, metadata: Option<ItemMetadata>) -> Self {
        if let Some(item) = self.items.get_mut(identifier) {
            item.metadata = metadata;
        }
        self
    }

    pub fn failing_transfer(self, identifier: &str, file: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((identifier.to_string(), file.to_string()), times);
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// Every successful transfer as (identifier, destination).
    pub fn fetched(&self) -> Vec<(String, PathBuf)> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fetched_identifiers(&self) -> Vec<String> {
        self.fetched().into_iter().map(|(id, _)| id).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Archive for MockArchive {
    async fn list_items(&self, collection: &str) -> Result<Vec<String>, ArchiveError> {
        if self.listing_fails {
            return Err(ArchiveError::Other("search unavailable".to_string()));
        }
        Ok(self.collections.get(collection).cloned().unwrap_or_default())
    }

    async fn item_metadata(&self, identifier: &str) -> Result<ItemMetadata, ArchiveError> {
        self.items
            .get(identifier)
            .and_then(|item| item.metadata.clone())
            .ok_or_else(|| ArchiveError::Other(format!("no metadata for {}", identifier)))
    }

    async fn list_files(&self, identifier: &str) -> Result<Vec<RemoteFile>, ArchiveError> {
        Ok(self
            .items
            .get(identifier)
            .map(|item| {
                item.files
                    .iter()
                    .map(|(name, _)| RemoteFile::named(name.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_file(
        &self,
        identifier: &str,
        file: &RemoteFile,
        destination: &Path,
        _verbose: bool,
    ) -> Result<(), ArchiveError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.transfer(identifier, file, destination).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl MockArchive {
    async fn transfer(
        &self,
        identifier: &str,
        file: &RemoteFile,
        destination: &Path,
    ) -> Result<(), ArchiveError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            let key = (identifier.to_string(), file.name.clone());
            if let Some(left) = failures.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ArchiveError::Other(format!(
                        "simulated transfer failure for {}",
                        file.name
                    )));
                }
            }
        }

        let bytes = self
            .items
            .get(identifier)
            .and_then(|item| item.files.iter().find(|(name, _)| *name == file.name))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| ArchiveError::Other(format!("no such file {}", file.name)))?;

        let io_err = |source| ArchiveError::Io {
            path: destination.to_path_buf(),
            source,
        };
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(destination, bytes).await.map_err(io_err)?;

        self.fetched
            .lock()
            .unwrap()
            .push((identifier.to_string(), destination.to_path_buf()));
        Ok(())
    }
}
