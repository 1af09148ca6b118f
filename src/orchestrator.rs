use crate::archive::Archive;
use crate::error::RunError;
use crate::fetcher::{FetchOptions, Fetcher, Outcome};
use crate::ledger::Ledger;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub collection: String,
    pub destination_root: PathBuf,
    pub staging_root: PathBuf,
    pub torrent_only: bool,
    pub verbose: bool,
    pub max_workers: usize,
    pub remove_unfinished: bool,
}

/// Aggregate counts for one run. Every listed item lands in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub downloaded: usize,
    /// Already present in the ledger; never dispatched.
    pub skipped: usize,
    pub no_files: usize,
    pub no_matching: usize,
    pub failed: usize,
}

impl RunSummary {
    fn tally(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Success => self.downloaded += 1,
            Outcome::NoFiles => self.no_files += 1,
            Outcome::NoMatchingFiles => self.no_matching += 1,
            Outcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Staging dirs are removed wholesale after relocation, so the staging root
/// must neither be, contain, nor sit inside the destination root.
async fn check_staging_root(staging_root: &Path, root: &Path) -> Result<(), RunError> {
    let destination = tokio::fs::canonicalize(root)
        .await
        .map_err(|source| RunError::Destination {
            path: root.to_path_buf(),
            source,
        })?;
    tokio::fs::create_dir_all(staging_root)
        .await
        .map_err(|source| RunError::Destination {
            path: staging_root.to_path_buf(),
            source,
        })?;
    let staging = tokio::fs::canonicalize(staging_root)
        .await
        .map_err(|source| RunError::Destination {
            path: staging_root.to_path_buf(),
            source,
        })?;

    if staging.starts_with(&destination) || destination.starts_with(&staging) {
        return Err(RunError::StagingOverlap {
            staging,
            destination,
        });
    }
    Ok(())
}

/// Downloads every item of a collection that the ledger does not already list.
pub async fn download_collection(
    archive: Arc<dyn Archive>,
    request: &RunRequest,
) -> Result<RunSummary, RunError> {
    let root = &request.destination_root;
    let ledger = Arc::new(Ledger::in_root(root));
    let completed = ledger.load().await.map_err(|source| RunError::LedgerRead {
        path: ledger.path().to_path_buf(),
        source,
    })?;
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|source| RunError::Destination {
            path: root.clone(),
            source,
        })?;
    check_staging_root(&request.staging_root, root).await?;

    info!(
        "🔍 Searching for items in collection '{}'...",
        request.collection
    );
    let items = archive
        .list_items(&request.collection)
        .await
        .map_err(|source| RunError::Listing {
            collection: request.collection.clone(),
            source,
        })?;
    let total = items.len();
    info!(
        "📊 Found {} items in collection '{}'.",
        total, request.collection
    );

    let mut summary = RunSummary {
        total,
        ..RunSummary::default()
    };
    let mut pending = Vec::new();
    for (idx, identifier) in items.into_iter().enumerate() {
        if completed.contains(&identifier) {
            summary.skipped += 1;
            if request.verbose {
                info!(
                    "[{}/{}] Skipping already downloaded item: {}",
                    idx + 1,
                    total,
                    identifier
                );
            }
            continue;
        }
        if request.verbose {
            info!("[{}/{}] Queuing item: {}", idx + 1, total, identifier);
        }
        pending.push(identifier);
    }

    let workers = request.max_workers.max(1);
    info!(
        "🚀 Downloading {} items with {} workers...",
        pending.len(),
        workers
    );

    let fetcher = Arc::new(Fetcher::new(
        archive,
        ledger,
        root.clone(),
        request.staging_root.clone(),
        FetchOptions {
            torrent_only: request.torrent_only,
            verbose: request.verbose,
            remove_unfinished: request.remove_unfinished,
        },
    ));
    let semaphore = Arc::new(Semaphore::new(workers));

    let pb = ProgressBar::new(pending.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} items {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );

    let (tx, mut rx) = mpsc::channel::<(String, Outcome)>(pending.len().max(1));
    let mut handles = Vec::with_capacity(pending.len());
    for identifier in pending {
        let sem = semaphore.clone();
        let tx = tx.clone();
        let fetcher = fetcher.clone();
        let run_id = identifier.clone();

        let handle = tokio::spawn(async move {
            let outcome = match sem.acquire().await {
                Ok(_permit) => fetcher.fetch(&run_id).await,
                Err(e) => Outcome::Failed(e.to_string()),
            };
            let _ = tx.send((run_id, outcome)).await;
        });
        handles.push((identifier, handle));
    }
    drop(tx);

    // Completion order, not submission order.
    while let Some((identifier, outcome)) = rx.recv().await {
        summary.tally(&outcome);
        pb.inc(1);
        pb.set_message(identifier);
    }

    for (identifier, handle) in handles {
        if let Err(e) = handle.await {
            error!("❌ Worker for {} did not finish: {}", identifier, e);
            summary.tally(&Outcome::Failed(e.to_string()));
            pb.inc(1);
        }
    }
    pb.finish_and_clear();

    info!(
        "🎉 Download complete. {} items downloaded, {} skipped.",
        summary.downloaded, summary.skipped
    );
    if summary.no_files + summary.no_matching + summary.failed > 0 {
        info!(
            "   {} without files, {} without matching files, {} failed (will retry on next run).",
            summary.no_files, summary.no_matching, summary.failed
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LEDGER_FILE_NAME;
    use crate::test_helpers::MockArchive;
    use std::time::Duration;

    fn request(root: &Path, collection: &str) -> RunRequest {
        RunRequest {
            collection: collection.to_string(),
            destination_root: root.join("dest"),
            staging_root: root.join("staging"),
            torrent_only: false,
            verbose: true,
            max_workers: 3,
            remove_unfinished: true,
        }
    }

    fn ledger_lines(request: &RunRequest) -> Vec<String> {
        std::fs::read_to_string(request.destination_root.join(LEDGER_FILE_NAME))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_demo_collection_torrent_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut req = request(temp_dir.path(), "demo");
        req.torrent_only = true;
        std::fs::create_dir_all(&req.destination_root).unwrap();
        std::fs::write(req.destination_root.join(LEDGER_FILE_NAME), "a\n").unwrap();

        let archive = Arc::new(
            MockArchive::new()
                .with_collection("demo", &["a", "b"])
                .with_item("a", &[("a.torrent", b"a")])
                .with_item("b", &[("b.torrent", b"torrent"), ("b.zip", b"zip")]),
        );

        let summary = download_collection(archive.clone(), &req).await.unwrap();
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total, 2);

        let b_dir = req.destination_root.join("b");
        assert_eq!(std::fs::read(b_dir.join("b.torrent")).unwrap(), b"torrent");
        assert!(!b_dir.join("b.zip").exists());
        assert!(!req.destination_root.join("a").exists());
        assert_eq!(archive.fetched_identifiers(), vec!["b"]);
        assert_eq!(ledger_lines(&req), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_second_run_downloads_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let req = request(temp_dir.path(), "games");
        let archive = Arc::new(
            MockArchive::new()
                .with_collection("games", &["g1", "g2", "g3"])
                .with_item("g1", &[("g1.zip", b"1")])
                .with_item("g2", &[("g2.zip", b"2")])
                .with_item("g3", &[("g3.zip", b"3")]),
        );

        let first = download_collection(archive.clone(), &req).await.unwrap();
        assert_eq!(first.downloaded, 3);
        assert_eq!(first.skipped, 0);

        let second = download_collection(archive.clone(), &req).await.unwrap();
        assert_eq!(second.downloaded, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(archive.fetched().len(), 3);

        let mut lines = ledger_lines(&req);
        lines.sort();
        assert_eq!(lines, vec!["g1", "g2", "g3"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_every_item_lands_in_one_bucket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut req = request(temp_dir.path(), "mixed");
        req.torrent_only = true;
        std::fs::create_dir_all(&req.destination_root).unwrap();
        std::fs::write(req.destination_root.join(LEDGER_FILE_NAME), "done\n").unwrap();

        let archive = Arc::new(
            MockArchive::new()
                .with_collection(
                    "mixed",
                    &["done", "ok", "empty", "plain", "broken", "unknown"],
                )
                .with_item("done", &[("done.torrent", b"d")])
                .with_item("ok", &[("ok.torrent", b"o")])
                .with_item("empty", &[])
                .with_item("plain", &[("plain.zip", b"p")])
                .with_item("broken", &[("broken.torrent", b"b")])
                .failing_transfer("broken", "broken.torrent", 1),
        );

        let summary = download_collection(archive, &req).await.unwrap();
        assert_eq!(
            summary,
            RunSummary {
                total: 6,
                downloaded: 1,
                skipped: 1,
                no_files: 2,
                no_matching: 1,
                failed: 1,
            }
        );
        assert_eq!(
            summary.downloaded
                + summary.skipped
                + summary.no_files
                + summary.no_matching
                + summary.failed,
            summary.total
        );
    }

    #[tokio::test]
    async fn test_failed_item_is_retried_next_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let req = request(temp_dir.path(), "retry");
        let archive = Arc::new(
            MockArchive::new()
                .with_collection("retry", &["c"])
                .with_item("c", &[("c1.bin", b"1"), ("c2.bin", b"2")])
                .failing_transfer("c", "c2.bin", 1),
        );

        let first = download_collection(archive.clone(), &req).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.downloaded, 0);
        assert!(req.destination_root.join("c").is_dir());
        assert!(ledger_lines(&req).is_empty());
        assert!(!req.staging_root.join("c").exists());

        let second = download_collection(archive.clone(), &req).await.unwrap();
        assert_eq!(second.downloaded, 1);
        assert_eq!(second.skipped, 0);
        assert_eq!(ledger_lines(&req), vec!["c"]);
        assert!(req.destination_root.join("c").join("c2.bin").exists());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_run() {
        let temp_dir = tempfile::tempdir().unwrap();
        let req = request(temp_dir.path(), "demo");
        let archive = Arc::new(MockArchive::new().failing_listing());

        let err = download_collection(archive, &req).await.unwrap_err();
        assert!(matches!(err, RunError::Listing { ref collection, .. } if collection == "demo"));
    }

    #[tokio::test]
    async fn test_staging_inside_destination_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("dest");
        let archive = Arc::new(
            MockArchive::new()
                .with_collection("demo", &["x"])
                .with_item("x", &[("x.zip", b"z")]),
        );

        for staging_root in [root.clone(), root.join("staging"), temp_dir.path().to_path_buf()] {
            let req = RunRequest {
                staging_root,
                destination_root: root.clone(),
                ..request(temp_dir.path(), "demo")
            };
            let err = download_collection(archive.clone(), &req).await.unwrap_err();
            assert!(matches!(err, RunError::StagingOverlap { .. }));
        }

        assert!(archive.fetched().is_empty());
        assert!(!root.join(LEDGER_FILE_NAME).exists());
        assert!(!root.join("x").exists());
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let temp_dir = tempfile::tempdir().unwrap();
        let req = request(temp_dir.path(), "nothing");

        let summary = download_collection(Arc::new(MockArchive::new()), &req)
            .await
            .unwrap();
        assert_eq!(summary, RunSummary::default());
        assert!(req.destination_root.is_dir());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_worker_pool_is_bounded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut req = request(temp_dir.path(), "many");
        req.max_workers = 2;

        let ids: Vec<String> = (0..8).map(|i| format!("item{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut archive = MockArchive::new()
            .with_collection("many", &id_refs)
            .with_fetch_delay(Duration::from_millis(20));
        for id in &ids {
            archive = archive.with_item(id, &[("data.bin", b"x")]);
        }
        let archive = Arc::new(archive);

        let summary = download_collection(archive.clone(), &req).await.unwrap();
        assert_eq!(summary.downloaded, 8);
        assert!(archive.max_in_flight() <= 2);
        assert!(archive.max_in_flight() >= 1);
    }

    #[tokio::test]
    async fn test_zero_workers_still_runs() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut req = request(temp_dir.path(), "one");
        req.max_workers = 0;
        let archive = Arc::new(
            MockArchive::new()
                .with_collection("one", &["solo"])
                .with_item("solo", &[("solo.zip", b"s")]),
        );

        let summary = download_collection(archive, &req).await.unwrap();
        assert_eq!(summary.downloaded, 1);
    }
}
