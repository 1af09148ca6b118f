use crate::archive::{safe_relative_path, Archive, ItemMetadata};
use crate::error::FetchError;
use crate::ledger::Ledger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

const NO_TITLE: &str = "No Title";
const NO_DESCRIPTION: &str = "No Description";

/// Terminal result of fetching one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NoFiles,
    NoMatchingFiles,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub torrent_only: bool,
    pub verbose: bool,
    pub remove_unfinished: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            torrent_only: false,
            verbose: false,
            remove_unfinished: true,
        }
    }
}

/// Downloads single items: stage, relocate, then record in the ledger.
pub struct Fetcher {
    archive: Arc<dyn Archive>,
    ledger: Arc<Ledger>,
    destination_root: PathBuf,
    staging_root: PathBuf,
    options: FetchOptions,
}

impl Fetcher {
    pub fn new(
        archive: Arc<dyn Archive>,
        ledger: Arc<Ledger>,
        destination_root: PathBuf,
        staging_root: PathBuf,
        options: FetchOptions,
    ) -> Self {
        Self {
            archive,
            ledger,
            destination_root,
            staging_root,
            options,
        }
    }

    pub fn staging_dir(&self, identifier: &str) -> PathBuf {
        self.staging_root.join(identifier)
    }

    pub fn final_dir(&self, identifier: &str) -> PathBuf {
        self.destination_root.join(identifier)
    }

    /// Never fails: every error is logged and folded into `Outcome::Failed`.
    pub async fn fetch(&self, identifier: &str) -> Outcome {
        if let Err(e) = validate_identifier(identifier) {
            error!("❌ Error downloading item {}: {}", identifier, e);
            return Outcome::Failed(e.to_string());
        }

        let staging = self.staging_dir(identifier);
        match self.try_fetch(identifier, &staging).await {
            Ok(Outcome::Success) => {
                info!("✅ Downloaded item '{}' successfully.", identifier);
                Outcome::Success
            }
            Ok(skipped) => {
                self.discard_staging(identifier, &staging).await;
                skipped
            }
            Err(e) => {
                error!("❌ Error downloading item {}: {}", identifier, e);
                warn!("🔁 [{}] Will retry this item on next run.", identifier);
                self.discard_staging(identifier, &staging).await;
                Outcome::Failed(e.to_string())
            }
        }
    }

    async fn try_fetch(&self, identifier: &str, staging: &Path) -> Result<Outcome, FetchError> {
        let final_dir = self.final_dir(identifier);
        for dir in [staging, final_dir.as_path()] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| FetchError::Prepare {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        self.write_summary(identifier, &final_dir).await?;

        let files = self
            .archive
            .list_files(identifier)
            .await
            .map_err(FetchError::Listing)?;
        if files.is_empty() {
            info!("⏩ {}: skipping, no files found.", identifier);
            return Ok(Outcome::NoFiles);
        }

        let selected: Vec<_> = if self.options.torrent_only {
            files.into_iter().filter(|f| f.is_torrent()).collect()
        } else {
            files
        };
        if selected.is_empty() {
            info!("⏩ {}: skipping, no torrent file found.", identifier);
            return Ok(Outcome::NoMatchingFiles);
        }

        for file in &selected {
            let transfer_err = |source| FetchError::Transfer {
                file: file.name.clone(),
                source,
            };
            let target = staging.join(safe_relative_path(&file.name).map_err(transfer_err)?);
            if self.options.verbose {
                info!("📥 {}: Downloading file {}...", identifier, file.name);
            }
            self.archive
                .fetch_file(identifier, file, &target, self.options.verbose)
                .await
                .map_err(transfer_err)?;
        }

        relocate(staging, &final_dir).await?;
        tokio::fs::remove_dir_all(staging)
            .await
            .map_err(|source| FetchError::Relocation {
                from: staging.to_path_buf(),
                to: final_dir.clone(),
                source,
            })?;

        self.ledger
            .record(identifier)
            .await
            .map_err(|source| FetchError::LedgerWrite {
                path: self.ledger.path().to_path_buf(),
                source,
            })?;

        Ok(Outcome::Success)
    }

    async fn write_summary(&self, identifier: &str, final_dir: &Path) -> Result<(), FetchError> {
        let metadata = match self.archive.item_metadata(identifier).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("⚠️  [{}] Metadata unavailable: {}", identifier, e);
                ItemMetadata::default()
            }
        };
        let title = metadata.title.as_deref().unwrap_or(NO_TITLE);
        let description = metadata.description.as_deref().unwrap_or(NO_DESCRIPTION);

        let path = final_dir.join(format!("{}_description.txt", identifier));
        tokio::fs::write(&path, summary_text(title, description))
            .await
            .map_err(|source| FetchError::Summary { path, source })?;

        if self.options.verbose {
            info!("Title: {}", title);
            info!("Description: {}", description);
        }
        Ok(())
    }

    async fn discard_staging(&self, identifier: &str, staging: &Path) {
        if !self.options.remove_unfinished {
            debug!("[{}] Keeping staging area {}", identifier, staging.display());
            return;
        }
        if tokio::fs::metadata(staging).await.is_err() {
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(staging).await {
            warn!(
                "⚠️  [{}] Failed to remove staging area {}: {}",
                identifier,
                staging.display(),
                e
            );
        }
    }
}

fn summary_text(title: &str, description: &str) -> String {
    format!("Title: {}\n\nDescription:\n{}\n", title, description)
}

fn validate_identifier(identifier: &str) -> Result<(), FetchError> {
    if identifier.is_empty()
        || identifier == "."
        || identifier == ".."
        || identifier.contains(['/', '\\'])
    {
        return Err(FetchError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}

/// Moves every file under `staging` directly into `final_dir`, dropping any
/// sub-directory structure.
async fn relocate(staging: &Path, final_dir: &Path) -> Result<(), FetchError> {
    let walk_err = |source| FetchError::Relocation {
        from: staging.to_path_buf(),
        to: final_dir.to_path_buf(),
        source,
    };
    let root = staging.to_path_buf();
    let staged = tokio::task::spawn_blocking(move || staged_files(&root))
        .await
        .map_err(|e| walk_err(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .map_err(walk_err)?;

    for src in staged {
        let Some(name) = src.file_name() else {
            continue;
        };
        let dst = final_dir.join(name);
        move_file(&src, &dst)
            .await
            .map_err(|source| FetchError::Relocation {
                from: src.clone(),
                to: dst.clone(),
                source,
            })?;
    }
    Ok(())
}

fn staged_files(staging: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut staged = Vec::new();
    for entry in WalkDir::new(staging) {
        let entry = entry?;
        if entry.file_type().is_file() {
            staged.push(entry.into_path());
        }
    }
    Ok(staged)
}

/// Rename, falling back to copy + delete across filesystems.
async fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(
                "rename {} -> {} failed ({}), copying instead",
                src.display(),
                dst.display(),
                e
            );
            tokio::fs::copy(src, dst).await?;
            tokio::fs::remove_file(src).await
        }
    }
}
