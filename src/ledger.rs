use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub const LEDGER_FILE_NAME: &str = "downloaded_games.log";

/// Append-only record of identifiers whose download fully completed.
///
/// One identifier per line. The in-memory view is whatever `load` returned at
/// the start of a run; appends go straight to disk under a single lock.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            append_lock: Mutex::new(()),
        }
    }

    /// Ledger co-located with the destination root.
    pub fn in_root(root: &Path) -> Self {
        Self::new(root.join(LEDGER_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the set of completed identifiers. A missing file is an empty set.
    pub async fn load(&self) -> std::io::Result<HashSet<String>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Appends one identifier. Only returns once the line is flushed to disk.
    ///
    /// A file whose last line lacks its newline (hand edits, torn writes) is
    /// terminated first so the new identifier stays on its own line.
    pub async fn record(&self, identifier: &str) -> std::io::Result<()> {
        let _guard = self.append_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut line = String::with_capacity(identifier.len() + 2);
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.push('\n');
            }
        }
        line.push_str(identifier);
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }
}
