//! Error types for data-directory validation and snapshot restore.

use crate::engine::RestoreStage;
use crate::types::DirectoryState;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a [`SnapshotStore`](crate::snapstore::SnapshotStore) adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error while reading a local store.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP request error against a remote store.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Listing could not be decoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The named object does not exist in the store.
    #[error("object {0} not found in snapshot store")]
    NotFound(String),

    /// The store answered with an unexpected status.
    #[error("unexpected response from {url}: HTTP {status}")]
    Status { url: String, status: u16 },

    /// The store returned a different number of bytes than requested.
    #[error("length mismatch for {name}: expected {expected} bytes, got {actual} bytes")]
    LengthMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
}

/// Errors that can occur while initializing a data directory.
#[derive(Error, Debug)]
pub enum InitError {
    /// I/O error during file operations.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// The restore options are unusable.
    #[error("invalid restore options: {0}")]
    InvalidOptions(String),

    /// The local data directory failed validation.
    #[error("data directory {path:?} is {state}: {detail}")]
    DataDirCorrupted {
        path: PathBuf,
        state: DirectoryState,
        detail: String,
    },

    /// The local directory is unusable and there is no remote store to rebuild it from.
    #[error("data directory {path:?} is {state} and no snapshot store is configured")]
    NoBackupConfigured {
        path: PathBuf,
        state: DirectoryState,
        /// The failed validation, as [`InitError::DataDirCorrupted`].
        #[source]
        source: Box<InitError>,
    },

    /// The store holds no full snapshot to use as a baseline.
    #[error("no full snapshot found in snapshot store")]
    NoSnapshotsFound,

    /// The chain cannot reach the requested revision.
    #[error(
        "snapshot chain stops at revision {reached} after {last} but revision {target} was requested{}",
        .next.as_ref().map(|n| format!(" (next available snapshot is {})", n)).unwrap_or_default()
    )]
    ChainGap {
        last: String,
        reached: u64,
        target: u64,
        next: Option<String>,
    },

    /// Listing the snapshot store failed.
    #[error("snapshot store error: {0}")]
    Store(#[from] StoreError),

    /// A chunk could not be fetched after the bounded local retries.
    #[error(
        "failed to fetch bytes {offset}..{end} of snapshot {snapshot} [{start_revision}, {end_revision}): {source}"
    )]
    ChunkFetchFailed {
        snapshot: String,
        start_revision: u64,
        end_revision: u64,
        offset: u64,
        end: u64,
        #[source]
        source: StoreError,
    },

    /// The fetched snapshot does not match its recorded content hash.
    #[error(
        "hash mismatch for snapshot {snapshot} [{start_revision}, {end_revision}): expected {expected}, got {actual}"
    )]
    HashMismatch {
        snapshot: String,
        start_revision: u64,
        end_revision: u64,
        expected: String,
        actual: String,
    },

    /// The snapshot bytes could not be decoded or applied.
    #[error("invalid content in snapshot {snapshot} [{start_revision}, {end_revision}): {reason}")]
    SnapshotContent {
        snapshot: String,
        start_revision: u64,
        end_revision: u64,
        reason: String,
    },

    /// Writing the bootstrap directory failed.
    #[error("failed to write bootstrap data at {path:?}: {source}")]
    BootstrapWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The restore state machine was asked to make a transition it does not allow.
    #[error("illegal restore stage transition from {from} to {to}")]
    IllegalTransition { from: RestoreStage, to: RestoreStage },

    /// A shutdown signal arrived before the restore finished.
    #[error("restore cancelled by shutdown signal")]
    Cancelled,

    /// An error annotated with the restore stage it happened in.
    #[error("{stage} failed: {source}")]
    Stage {
        stage: RestoreStage,
        #[source]
        source: Box<InitError>,
    },
}

impl InitError {
    /// Returns the underlying error, looking through [`InitError::Stage`].
    pub fn cause(&self) -> &InitError {
        match self {
            InitError::Stage { source, .. } => source.cause(),
            other => other,
        }
    }

    /// The stage the error was raised in, when known.
    pub fn stage(&self) -> Option<RestoreStage> {
        match self {
            InitError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn bootstrap(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> InitError {
        let path = path.into();
        move |source| InitError::BootstrapWriteFailed { path, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_looks_through_stage() {
        let err = InitError::Stage {
            stage: RestoreStage::FetchingBaseline,
            source: Box::new(InitError::NoSnapshotsFound),
        };
        assert!(matches!(err.cause(), InitError::NoSnapshotsFound));
        assert_eq!(err.stage(), Some(RestoreStage::FetchingBaseline));
        assert_eq!(
            err.to_string(),
            "fetching baseline failed: no full snapshot found in snapshot store"
        );
    }

    #[test]
    fn test_chain_gap_names_next_snapshot() {
        let err = InitError::ChainGap {
            last: "Full-100".to_string(),
            reached: 100,
            target: 150,
            next: Some("Incr-120-150".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("revision 100 after Full-100"));
        assert!(msg.contains("next available snapshot is Incr-120-150"));
    }
}
