//! SnapGuard - startup guard that keeps an etcd-style data directory restorable
//!
//! On every boot the guard validates the local data directory. A valid
//! directory is left untouched; an invalid one is rebuilt from a remote chain
//! of snapshots (one full snapshot followed by contiguous deltas) and seeded
//! as a fresh single-member cluster.
//!
//! # Features
//!
//! - **Read-only Validation**: Checks identity, state file checksum and WAL CRCs
//! - **Gap-free Chains**: Deltas are only applied while they start where the previous one ended
//! - **Parallel Chunk Fetching**: Bounded concurrency with per-chunk retries
//! - **Integrity Verification**: SHA-256 or MD5 content hashes per snapshot
//! - **All-or-nothing Restore**: The new directory is built aside and swapped in at the end
//!
//! # Example
//!
//! ```no_run
//! use snapguard::{initialize, RestoreOptions, SnapstoreConfig, UrlsMap};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut options = RestoreOptions::new("/var/etcd/data", "etcd-0");
//! options.peer_urls = vec!["http://10.0.0.1:2380".to_string()];
//! options.cluster_urls = UrlsMap::single("etcd-0", &options.peer_urls);
//!
//! let store = SnapstoreConfig::default();
//! let outcome = initialize(&options, Some(&store)).await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod chain;
pub mod cluster;
pub mod content;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod layout;
pub mod snapstore;
pub mod types;
pub mod validator;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{plan_chain, resolve_chain};
pub use cluster::UrlsMap;
pub use engine::{RestoreEngine, RestoreStage};
pub use error::{InitError, StoreError};
pub use snapstore::{HttpSnapStore, LocalSnapStore, SnapshotStore};
pub use types::{
    DirectoryState, InitOutcome, RestoreOptions, RestoreSummary, SnapshotChain, SnapshotKind,
    SnapshotMetadata, SnapstoreConfig, StoreProvider,
};
pub use validator::{validate, Validation};

use tokio::sync::watch;

/// Validates the data directory and restores it from the store when it is not usable.
///
/// # Arguments
///
/// * `options` - Member, cluster and fetch options
/// * `store_config` - Snapshot store to restore from; `None` disables restores
///
/// # Returns
///
/// [`InitOutcome::AlreadyValid`] when the directory was left alone,
/// [`InitOutcome::Restored`] when it was rebuilt, or an error.
pub async fn initialize(
    options: &RestoreOptions,
    store_config: Option<&SnapstoreConfig>,
) -> Result<InitOutcome, InitError> {
    // Never signalled: the sender is dropped right away.
    let (_, shutdown) = watch::channel(false);
    initialize_with_shutdown(options, store_config, shutdown).await
}

/// Like [`initialize`], aborting in-flight work once `shutdown` carries `true`.
pub async fn initialize_with_shutdown(
    options: &RestoreOptions,
    store_config: Option<&SnapstoreConfig>,
    shutdown: watch::Receiver<bool>,
) -> Result<InitOutcome, InitError> {
    let mut engine = build_engine(options, store_config)?.with_shutdown(shutdown);
    engine.initialize().await
}

/// Builds a [`RestoreEngine`] for `options`, opening the configured store if any.
pub fn build_engine(
    options: &RestoreOptions,
    store_config: Option<&SnapstoreConfig>,
) -> Result<RestoreEngine, InitError> {
    let store = store_config.map(snapstore::open).transpose()?;
    let temp_dir = store_config
        .map(|config| config.temp_dir.clone())
        .unwrap_or_else(|| SnapstoreConfig::default().temp_dir);
    Ok(RestoreEngine::new(options.clone(), store, temp_dir))
}
