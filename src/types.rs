//! Data structures shared by the validator, resolver, fetcher and engine.

use crate::cluster::UrlsMap;
use crate::error::InitError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Kind of a stored snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Self-contained image of the store at a revision.
    Full,
    /// Mutations between two revisions, applied on top of a baseline.
    Delta,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotKind::Full => f.write_str("full"),
            SnapshotKind::Delta => f.write_str("delta"),
        }
    }
}

/// Metadata for a snapshot as recorded in the store listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// Object name inside the store prefix.
    pub name: String,
    pub kind: SnapshotKind,
    /// First revision covered. For a full snapshot this equals `end_revision`.
    pub start_revision: u64,
    /// Revision of the store once this snapshot has been applied.
    pub end_revision: u64,
    /// Unix timestamp (seconds) when the snapshot was uploaded.
    pub created_on: i64,
    /// Size of the stored object in bytes.
    pub size: u64,
    /// Recorded content hash, formatted as `<algo>:<hex>`.
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Whether the stored bytes are gzip-compressed.
    #[serde(default)]
    pub compressed: bool,
}

impl SnapshotMetadata {
    /// Human readable revision range, e.g. `[100, 150)`.
    pub fn range_label(&self) -> String {
        format!("[{}, {})", self.start_revision, self.end_revision)
    }
}

impl fmt::Display for SnapshotMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.range_label())
    }
}

/// Ordered restore plan: one full snapshot followed by contiguous deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChain {
    pub snapshots: Vec<SnapshotMetadata>,
    /// Revision the plan was asked to reach.
    pub target_revision: u64,
}

impl SnapshotChain {
    pub fn base(&self) -> &SnapshotMetadata {
        &self.snapshots[0]
    }

    pub fn deltas(&self) -> &[SnapshotMetadata] {
        &self.snapshots[1..]
    }

    /// Revision the store will be at after the whole chain is applied.
    pub fn restored_revision(&self) -> u64 {
        self.snapshots
            .last()
            .map(|s| s.end_revision)
            .unwrap_or_default()
    }

    /// `true` when the chain stops short of the requested revision.
    pub fn is_truncated(&self) -> bool {
        self.restored_revision() < self.target_revision
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Validity of a local data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    Valid,
    Missing,
    Corrupted,
    VersionMismatch,
}

impl fmt::Display for DirectoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectoryState::Valid => f.write_str("valid"),
            DirectoryState::Missing => f.write_str("missing"),
            DirectoryState::Corrupted => f.write_str("corrupted"),
            DirectoryState::VersionMismatch => f.write_str("at an unsupported version"),
        }
    }
}

/// Half-open byte range `[start, end)` of a stored object.
pub type ByteRange = Range<u64>;

/// Options controlling how a data directory is validated and restored.
///
/// # Example
///
/// ```
/// use snapguard::{RestoreOptions, UrlsMap};
///
/// let mut options = RestoreOptions::new("/var/etcd/data", "etcd-0");
/// options.peer_urls = vec!["http://10.0.0.1:2380".to_string()];
/// options.cluster_urls = UrlsMap::single("etcd-0", &options.peer_urls);
/// options.max_fetchers = 8;
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Data directory of the consensus engine.
    pub data_dir: PathBuf,
    /// Name of this member.
    pub name: String,
    /// Initial cluster: member name to peer URLs.
    pub cluster_urls: UrlsMap,
    /// Advertised peer URLs of this member.
    pub peer_urls: Vec<String>,
    /// Token of the new cluster.
    pub cluster_token: String,
    /// Skip content hash verification of fetched snapshots (default: false).
    ///
    /// Every skipped check is logged; this is meant for operators who accept
    /// restoring from a backup whose hash cannot be verified.
    pub skip_hash_check: bool,
    /// Maximum number of concurrent chunk fetches per snapshot (default: 6).
    pub max_fetchers: usize,
    /// Size of one fetched chunk in bytes (default: 8 MiB).
    pub chunk_size: u64,
    /// Restore up to this revision instead of the latest available one.
    pub restore_up_to: Option<u64>,
    /// Fail instead of restoring a truncated chain when a gap is found.
    pub strict_chain: bool,
    /// Attempts per chunk after the first failure (default: 3).
    pub fetch_retries: usize,
    /// Base delay between chunk retries (default: 500ms).
    pub fetch_backoff: Duration,
}

impl RestoreOptions {
    /// Creates options with defaults for everything but the directory and member name.
    pub fn new(data_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            name: name.into(),
            cluster_urls: UrlsMap::default(),
            peer_urls: Vec::new(),
            cluster_token: "etcd-cluster".to_string(),
            skip_hash_check: false,
            max_fetchers: 6,
            chunk_size: 8 * 1024 * 1024,
            restore_up_to: None,
            strict_chain: false,
            fetch_retries: 3,
            fetch_backoff: Duration::from_millis(500),
        }
    }

    /// Checks that the options describe a usable single-member bootstrap.
    pub fn validate(&self) -> Result<(), InitError> {
        if self.name.trim().is_empty() {
            return Err(InitError::InvalidOptions("member name must not be empty".into()));
        }
        if self.cluster_token.trim().is_empty() {
            return Err(InitError::InvalidOptions("cluster token must not be empty".into()));
        }
        if self.max_fetchers == 0 {
            return Err(InitError::InvalidOptions("max fetchers must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(InitError::InvalidOptions("chunk size must be at least 1 byte".into()));
        }
        if self.peer_urls.is_empty() {
            return Err(InitError::InvalidOptions("at least one peer URL is required".into()));
        }
        let own = self.cluster_urls.urls(&self.name).ok_or_else(|| {
            InitError::InvalidOptions(format!(
                "initial cluster {:?} has no entry for member {}",
                self.cluster_urls.initial_cluster(),
                self.name
            ))
        })?;
        if self.cluster_urls.len() != 1 {
            return Err(InitError::InvalidOptions(format!(
                "a restored cluster starts with a single member, but initial cluster lists {}",
                self.cluster_urls.names().collect::<Vec<_>>().join(", ")
            )));
        }
        if !self.peer_urls.iter().all(|u| own.contains(u)) || own.len() != self.peer_urls.len() {
            return Err(InitError::InvalidOptions(format!(
                "initial cluster URLs for {} ({}) do not match peer URLs ({})",
                self.name,
                own.iter().cloned().collect::<Vec<_>>().join(","),
                self.peer_urls.join(",")
            )));
        }
        Ok(())
    }
}

/// Backend holding the snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreProvider {
    /// A directory on a locally mounted filesystem.
    Local,
    /// An HTTP(S) endpoint serving objects, e.g. a public S3/R2 bucket.
    Http,
}

impl std::str::FromStr for StoreProvider {
    type Err = InitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(StoreProvider::Local),
            "http" | "https" | "s3" | "r2" => Ok(StoreProvider::Http),
            other => Err(InitError::InvalidOptions(format!(
                "unsupported storage provider {:?}",
                other
            ))),
        }
    }
}

/// Layout version appended to every store prefix.
pub const BACKUP_FORMAT_VERSION: &str = "v1";

/// Configuration of the snapshot store.
///
/// # Example
///
/// ```
/// use snapguard::{SnapstoreConfig, StoreProvider};
///
/// let config = SnapstoreConfig {
///     provider: StoreProvider::Http,
///     container: "https://pub-backups.r2.dev".to_string(),
///     prefix: "etcd-main".to_string(),
///     temp_dir: ".snapguard.tmp".into(),
/// };
/// assert_eq!(config.effective_prefix(), "etcd-main/v1");
/// ```
#[derive(Debug, Clone)]
pub struct SnapstoreConfig {
    pub provider: StoreProvider,
    /// Bucket base URL or local directory.
    pub container: String,
    /// Prefix of the backups inside the container.
    pub prefix: String,
    /// Directory for downloads in progress.
    pub temp_dir: PathBuf,
}

impl SnapstoreConfig {
    /// Prefix including the backup format version.
    pub fn effective_prefix(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            BACKUP_FORMAT_VERSION.to_string()
        } else {
            format!("{}/{}", prefix, BACKUP_FORMAT_VERSION)
        }
    }
}

impl Default for SnapstoreConfig {
    fn default() -> Self {
        Self {
            provider: StoreProvider::Local,
            container: ".snapguard.backups".to_string(),
            prefix: String::new(),
            temp_dir: PathBuf::from(".snapguard.tmp"),
        }
    }
}

/// Result of a successful [`initialize`](crate::initialize).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// The data directory was valid and left untouched.
    AlreadyValid,
    /// The data directory was rebuilt from the snapshot store.
    Restored(RestoreSummary),
}

/// What a restore produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub revision: u64,
    pub snapshots_applied: usize,
    pub truncated: bool,
    pub member_id: u64,
    pub cluster_id: u64,
}
