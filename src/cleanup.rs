use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Lowercases and dot-prefixes configured extensions (`"PNG"` -> `".png"`).
pub fn normalize_extensions<S: AsRef<str>>(extensions: &[S]) -> HashSet<String> {
    extensions
        .iter()
        .map(|ext| ext.as_ref().trim().to_lowercase())
        .filter(|ext| !ext.is_empty() && ext != ".")
        .map(|ext| {
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{}", ext)
            }
        })
        .collect()
}

fn matches_extension(path: &Path, extensions: &HashSet<String>) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.contains(&format!(".{}", ext.to_lowercase())))
        .unwrap_or(false)
}

/// Deletes files with a listed extension from every item folder under `root`.
///
/// Must only run once downloads have finished. Files directly under `root`
/// (such as the ledger) are not item folders and are left alone. A file that
/// cannot be removed is logged and counted; the sweep carries on.
pub fn sweep(root: &Path, extensions: &HashSet<String>, verbose: bool) -> SweepReport {
    info!("🧹 Starting cleanup of torrent, image, and metadata files...");
    let mut report = SweepReport::default();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("⚠️  Cannot read {}: {}", root.display(), e);
            return report;
        }
    };

    for entry in entries.flatten() {
        let item_path = entry.path();
        if !item_path.is_dir() {
            continue;
        }

        let before = report.removed;
        for file in WalkDir::new(&item_path) {
            let file = match file {
                Ok(file) => file,
                Err(e) => {
                    warn!("⚠️  Skipping unreadable entry in {}: {}", item_path.display(), e);
                    continue;
                }
            };
            if !file.file_type().is_file() || !matches_extension(file.path(), extensions) {
                continue;
            }
            match fs::remove_file(file.path()) {
                Ok(()) => {
                    report.removed += 1;
                    if verbose {
                        info!("Removed file {}", file.path().display());
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!("❌ Failed to remove {}: {}", file.path().display(), e);
                }
            }
        }

        if verbose && report.removed > before {
            info!("Finished cleaning some files in {}", item_path.display());
        }
    }

    info!(
        "✅ Cleanup completed: {} removed, {} failed.",
        report.removed, report.failed
    );
    report
}
