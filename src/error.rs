use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by the remote archive collaborator.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("malformed response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Checksum {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("refusing unsafe file name: {0}")]
    UnsafeName(String),

    #[error("{0}")]
    Other(String),
}

/// Per-item failures. These never escape the fetcher; they become `Outcome::Failed`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("failed to prepare {}: {source}", .path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to list files: {0}")]
    Listing(#[source] ArchiveError),

    #[error("transfer of {file} failed: {source}")]
    Transfer {
        file: String,
        #[source]
        source: ArchiveError,
    },

    #[error("failed to move {} to {}: {source}", .from.display(), .to.display())]
    Relocation {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write summary {}: {source}", .path.display())]
    Summary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to record completion in {}: {source}", .path.display())]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors that abort a whole orchestration run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to prepare destination {}: {source}", .path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read ledger {}: {source}", .path.display())]
    LedgerRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "staging root {} overlaps destination root {}",
        .staging.display(),
        .destination.display()
    )]
    StagingOverlap {
        staging: PathBuf,
        destination: PathBuf,
    },

    #[error("failed to list items in collection '{collection}': {source}")]
    Listing {
        collection: String,
        #[source]
        source: ArchiveError,
    },
}
