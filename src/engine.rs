//! Restore state machine: validate, resolve, fetch, verify, apply, bootstrap.

use crate::bootstrap::{install, remove_dir_if_exists, sibling, write_bootstrap};
use crate::chain::resolve_chain;
use crate::content::{apply_delta, decode_delta, decode_full, read_snapshot, StateImage};
use crate::error::InitError;
use crate::fetch::{fetch_snapshot, FetchSettings};
use crate::snapstore::SnapshotStore;
use crate::types::{InitOutcome, RestoreOptions, RestoreSummary, SnapshotChain, SnapshotMetadata};
use crate::validator::{self, Validation};
use crate::verify::verify_file;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Stage of a restore run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Init,
    Validating,
    AlreadyValid,
    NeedsRestore,
    FetchingBaseline,
    ApplyingDeltas,
    Bootstrapping,
    Done,
    Failed,
}

impl RestoreStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreStage::AlreadyValid | RestoreStage::Done | RestoreStage::Failed
        )
    }

    /// Whether the state machine may move from `self` to `next`.
    ///
    /// `Init -> NeedsRestore` is the forced restore path that skips validation.
    pub fn can_transition_to(self, next: RestoreStage) -> bool {
        use RestoreStage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Init, Validating)
            | (Init, NeedsRestore)
            | (Validating, AlreadyValid)
            | (Validating, NeedsRestore)
            | (NeedsRestore, FetchingBaseline)
            | (FetchingBaseline, ApplyingDeltas)
            | (ApplyingDeltas, Bootstrapping)
            | (Bootstrapping, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RestoreStage::Init => "init",
            RestoreStage::Validating => "validating",
            RestoreStage::AlreadyValid => "already valid",
            RestoreStage::NeedsRestore => "needs restore",
            RestoreStage::FetchingBaseline => "fetching baseline",
            RestoreStage::ApplyingDeltas => "applying deltas",
            RestoreStage::Bootstrapping => "bootstrapping",
            RestoreStage::Done => "done",
            RestoreStage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Scratch directories of one restore run.
///
/// Removed by [`Scratch::cleanup`]; dropping an uncleaned value (a cancelled
/// restore future) removes them synchronously.
struct Scratch {
    fetch_dir: PathBuf,
    staging: PathBuf,
    cleaned: bool,
}

impl Scratch {
    fn new(temp_dir: &Path, data_dir: &Path) -> Self {
        Self {
            fetch_dir: temp_dir.join("fetch"),
            staging: sibling(data_dir, ".restoring"),
            cleaned: false,
        }
    }

    /// Clears leftovers of an interrupted earlier run.
    async fn prepare(&self) -> Result<(), InitError> {
        remove_dir_if_exists(&self.fetch_dir).await?;
        remove_dir_if_exists(&self.staging).await?;
        tokio::fs::create_dir_all(&self.fetch_dir).await?;
        Ok(())
    }

    async fn cleanup(&mut self) {
        for dir in [&self.fetch_dir, &self.staging] {
            if let Err(e) = remove_dir_if_exists(dir).await {
                warn!("Failed to clean up {:?}: {}", dir, e);
            }
        }
        self.cleaned = true;
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        for dir in [&self.fetch_dir, &self.staging] {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to clean up {:?}: {}", dir, e);
                }
            }
        }
    }
}

/// Decides whether the data directory is usable and rebuilds it from the store when it is not.
///
/// # Example
///
/// ```no_run
/// use snapguard::{LocalSnapStore, RestoreEngine, RestoreOptions, UrlsMap};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut options = RestoreOptions::new("/var/etcd/data", "etcd-0");
/// options.peer_urls = vec!["http://10.0.0.1:2380".to_string()];
/// options.cluster_urls = UrlsMap::single("etcd-0", &options.peer_urls);
///
/// let store = Arc::new(LocalSnapStore::new("/mnt/backups/v1"));
/// let mut engine = RestoreEngine::new(options, Some(store), "/tmp/snapguard".into());
/// let outcome = engine.initialize().await?;
/// println!("{:?}", outcome);
/// # Ok(())
/// # }
/// ```
pub struct RestoreEngine {
    options: RestoreOptions,
    store: Option<Arc<dyn SnapshotStore>>,
    temp_dir: PathBuf,
    shutdown: watch::Receiver<bool>,
    stage: RestoreStage,
}

impl RestoreEngine {
    pub fn new(
        options: RestoreOptions,
        store: Option<Arc<dyn SnapshotStore>>,
        temp_dir: PathBuf,
    ) -> Self {
        // Without a sender the shutdown signal never fires.
        let (_, shutdown) = watch::channel(false);
        Self {
            options,
            store,
            temp_dir,
            shutdown,
            stage: RestoreStage::Init,
        }
    }

    /// Aborts in-flight work once `shutdown` carries `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn stage(&self) -> RestoreStage {
        self.stage
    }

    pub fn options(&self) -> &RestoreOptions {
        &self.options
    }

    /// Validates the data directory without touching anything.
    pub async fn validate_only(&self) -> Result<Validation, InitError> {
        let data_dir = self.options.data_dir.clone();
        tokio::task::spawn_blocking(move || validator::validate(&data_dir))
            .await
            .map_err(|e| InitError::Io(std::io::Error::other(format!("Task join error: {}", e))))
    }

    /// Leaves a valid data directory alone, restores an invalid one.
    ///
    /// A valid directory never causes the snapshot store to be contacted, and
    /// the restore options are only checked once a restore is needed.
    pub async fn initialize(&mut self) -> Result<InitOutcome, InitError> {
        self.stage = RestoreStage::Init;

        self.advance(RestoreStage::Validating)?;
        let validation = match self.validate_only().await {
            Ok(validation) => validation,
            Err(e) => {
                self.stage = RestoreStage::Failed;
                return Err(e);
            }
        };
        if validation.is_valid() {
            self.advance(RestoreStage::AlreadyValid)?;
            info!("✅ Data directory {:?} is valid, nothing to restore", self.options.data_dir);
            return Ok(InitOutcome::AlreadyValid);
        }

        warn!("⚠️  {}", validation);
        self.advance(RestoreStage::NeedsRestore)?;
        self.run_restore(validation).await
    }

    /// Rebuilds the data directory from the store without validating it first.
    pub async fn restore(&mut self) -> Result<InitOutcome, InitError> {
        self.stage = RestoreStage::Init;

        self.advance(RestoreStage::NeedsRestore)?;
        info!("Forced restore of {:?}", self.options.data_dir);
        let validation = match self.validate_only().await {
            Ok(validation) => validation,
            Err(e) => {
                self.stage = RestoreStage::Failed;
                return Err(e);
            }
        };
        self.run_restore(validation).await
    }

    fn advance(&mut self, next: RestoreStage) -> Result<(), InitError> {
        if !self.stage.can_transition_to(next) {
            return Err(InitError::IllegalTransition {
                from: self.stage,
                to: next,
            });
        }
        debug!("Restore stage {} -> {}", self.stage, next);
        self.stage = next;
        Ok(())
    }

    async fn run_restore(&mut self, validation: Validation) -> Result<InitOutcome, InitError> {
        if let Err(e) = self.options.validate() {
            self.stage = RestoreStage::Failed;
            return Err(e);
        }
        let Some(store) = self.store.clone() else {
            self.stage = RestoreStage::Failed;
            return Err(InitError::NoBackupConfigured {
                path: self.options.data_dir.clone(),
                state: validation.state,
                source: Box::new(validation.into_error()),
            });
        };

        let mut scratch = Scratch::new(&self.temp_dir, &self.options.data_dir);
        let result = match scratch.prepare().await {
            Ok(()) => self.restore_from(&store, &scratch).await,
            Err(e) => Err(e),
        };
        scratch.cleanup().await;

        match result {
            Ok(summary) => {
                self.advance(RestoreStage::Done)?;
                info!(
                    "✅ Restored {:?} to revision {} from {} snapshot(s)",
                    self.options.data_dir, summary.revision, summary.snapshots_applied
                );
                Ok(InitOutcome::Restored(summary))
            }
            Err(e) => {
                let stage = self.stage;
                self.stage = RestoreStage::Failed;
                error!("Restore failed while {}: {}", stage, e);
                Err(InitError::Stage {
                    stage,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn restore_from(
        &mut self,
        store: &Arc<dyn SnapshotStore>,
        scratch: &Scratch,
    ) -> Result<RestoreSummary, InitError> {
        self.advance(RestoreStage::FetchingBaseline)?;
        let chain = resolve_chain(
            store.as_ref(),
            self.options.restore_up_to,
            self.options.strict_chain,
        )
        .await?;
        log_plan(&chain);

        let settings = FetchSettings::from(&self.options);
        let base = chain.base();
        let bytes = self.fetch_verified(store, base, &scratch.fetch_dir, &settings).await?;
        let mut image = decode_full(&bytes, base)?;
        info!("Baseline {} holds {} key(s)", base, image.kvs.len());

        self.advance(RestoreStage::ApplyingDeltas)?;
        for delta in chain.deltas() {
            let bytes = self.fetch_verified(store, delta, &scratch.fetch_dir, &settings).await?;
            let events = decode_delta(&bytes, delta)?;
            apply_delta(&mut image, delta, &events)?;
            info!("Applied {} ({} event(s)), now at revision {}", delta, events.len(), image.revision);
        }

        self.advance(RestoreStage::Bootstrapping)?;
        let info = self.bootstrap(&image, &scratch.staging).await?;

        Ok(RestoreSummary {
            revision: image.revision,
            snapshots_applied: chain.len(),
            truncated: chain.is_truncated(),
            member_id: info.member_id,
            cluster_id: info.cluster_id,
        })
    }

    /// Fetches and verifies one snapshot, returning its decompressed bytes.
    ///
    /// The fetched file is removed once it has been read.
    async fn fetch_verified(
        &self,
        store: &Arc<dyn SnapshotStore>,
        snapshot: &SnapshotMetadata,
        fetch_dir: &Path,
        settings: &FetchSettings,
    ) -> Result<Vec<u8>, InitError> {
        let report = fetch_snapshot(store, snapshot, fetch_dir, settings, &self.shutdown).await?;
        verify_file(&report.path, snapshot, self.options.skip_hash_check).await?;
        let bytes = read_snapshot(&report.path, snapshot).await?;
        tokio::fs::remove_file(&report.path).await?;
        Ok(bytes)
    }

    async fn bootstrap(
        &self,
        image: &StateImage,
        staging: &Path,
    ) -> Result<crate::bootstrap::BootstrapInfo, InitError> {
        if *self.shutdown.borrow() {
            return Err(InitError::Cancelled);
        }
        let info = write_bootstrap(staging, image, &self.options).await?;
        install(staging, &self.options.data_dir).await?;
        Ok(info)
    }
}

fn log_plan(chain: &SnapshotChain) {
    info!(
        "📋 Restore plan: {} snapshot(s) from {} reaching revision {} (target {})",
        chain.len(),
        chain.base(),
        chain.restored_revision(),
        chain.target_revision
    );
    for snapshot in chain.deltas() {
        debug!("  then {}", snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::UrlsMap;
    use crate::content::{DeltaEvent, KeyValue};
    use crate::layout::{decode_state_file, DataLayout};
    use crate::testing::MemoryStore;
    use crate::types::DirectoryState;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn data_dir(&self) -> PathBuf {
            self.dir.path().join("data")
        }

        fn temp_dir(&self) -> PathBuf {
            self.dir.path().join("tmp")
        }

        fn options(&self) -> RestoreOptions {
            let mut options = RestoreOptions::new(self.data_dir(), "etcd-0");
            options.peer_urls = vec!["http://10.0.0.1:2380".to_string()];
            options.cluster_urls = UrlsMap::single("etcd-0", &options.peer_urls);
            options.chunk_size = 16;
            options.max_fetchers = 3;
            options.fetch_retries = 1;
            options.fetch_backoff = Duration::from_millis(2);
            options
        }

        fn engine(&self, options: RestoreOptions) -> RestoreEngine {
            let store: Arc<dyn SnapshotStore> = self.store.clone();
            RestoreEngine::new(options, Some(store), self.temp_dir())
        }

        fn restored_image(&self) -> StateImage {
            let db = std::fs::read(DataLayout::new(self.data_dir()).db_path()).unwrap();
            decode_state_file(&db).unwrap()
        }

        fn assert_no_scratch_left(&self) {
            assert!(!self.temp_dir().join("fetch").exists());
            assert!(!sibling(&self.data_dir(), ".restoring").exists());
        }
    }

    fn restored(outcome: InitOutcome) -> RestoreSummary {
        match outcome {
            InitOutcome::Restored(summary) => summary,
            other => panic!("expected a restore, got {:?}", other),
        }
    }

    fn base_image() -> StateImage {
        let mut image = StateImage {
            revision: 100,
            ..Default::default()
        };
        for (key, value) in [("/a", "v1"), ("/b", "gone-soon")] {
            image.kvs.insert(
                key.to_string(),
                KeyValue {
                    value: value.to_string(),
                    create_revision: 10,
                    mod_revision: 10,
                    version: 1,
                },
            );
        }
        image
    }

    fn delta_events() -> Vec<DeltaEvent> {
        vec![
            DeltaEvent::put("/a", "v2", 120),
            DeltaEvent::delete("/b", 130),
            DeltaEvent::put("/c", "new", 150),
        ]
    }

    #[test]
    fn test_stage_transitions() {
        use RestoreStage::*;
        assert!(Init.can_transition_to(Validating));
        assert!(Init.can_transition_to(NeedsRestore));
        assert!(Validating.can_transition_to(AlreadyValid));
        assert!(ApplyingDeltas.can_transition_to(Failed));
        assert!(!Validating.can_transition_to(FetchingBaseline));
        assert!(!AlreadyValid.can_transition_to(NeedsRestore));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert_eq!(FetchingBaseline.to_string(), "fetching baseline");
    }

    #[tokio::test]
    async fn test_restore_full_and_delta() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        fx.store.put_delta(100, 150, &delta_events(), 2);

        let mut engine = fx.engine(fx.options());
        let summary = restored(engine.initialize().await.unwrap());
        assert_eq!(summary.revision, 150);
        assert_eq!(summary.snapshots_applied, 2);
        assert!(!summary.truncated);
        assert_eq!(engine.stage(), RestoreStage::Done);

        let image = fx.restored_image();
        assert_eq!(image.revision, 150);
        assert_eq!(image.kvs["/a"].value, "v2");
        assert_eq!(image.kvs["/a"].version, 2);
        assert!(!image.kvs.contains_key("/b"));
        assert_eq!(image.kvs["/c"].create_revision, 150);

        assert!(validator::validate(&fx.data_dir()).is_valid());
        fx.assert_no_scratch_left();
    }

    #[tokio::test]
    async fn test_second_initialize_is_noop() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);

        let mut engine = fx.engine(fx.options());
        assert!(matches!(engine.initialize().await.unwrap(), InitOutcome::Restored(_)));
        let list_calls = fx.store.list_calls();
        let get_calls = fx.store.get_calls();

        let db_before = std::fs::read(DataLayout::new(fx.data_dir()).db_path()).unwrap();
        assert_eq!(engine.initialize().await.unwrap(), InitOutcome::AlreadyValid);
        assert_eq!(engine.stage(), RestoreStage::AlreadyValid);
        assert_eq!(fx.store.list_calls(), list_calls);
        assert_eq!(fx.store.get_calls(), get_calls);
        let db_after = std::fs::read(DataLayout::new(fx.data_dir()).db_path()).unwrap();
        assert_eq!(db_before, db_after);
    }

    #[tokio::test]
    async fn test_valid_directory_never_contacts_store() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        fx.engine(fx.options()).initialize().await.unwrap();

        let other = Arc::new(MemoryStore::new());
        let store: Arc<dyn SnapshotStore> = other.clone();
        let mut engine = RestoreEngine::new(fx.options(), Some(store), fx.temp_dir());
        assert_eq!(engine.initialize().await.unwrap(), InitOutcome::AlreadyValid);
        assert_eq!(other.list_calls(), 0);
        assert_eq!(other.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_backup_configured() {
        let fx = Fixture::new();
        let mut engine = RestoreEngine::new(fx.options(), None, fx.temp_dir());

        let err = engine.initialize().await.unwrap_err();
        match err {
            InitError::NoBackupConfigured {
                path,
                state,
                source,
            } => {
                assert_eq!(path, fx.data_dir());
                assert_eq!(state, DirectoryState::Missing);
                assert!(matches!(
                    *source,
                    InitError::DataDirCorrupted {
                        state: DirectoryState::Missing,
                        ..
                    }
                ));
            }
            other => panic!("expected NoBackupConfigured, got {:?}", other),
        }
        assert_eq!(engine.stage(), RestoreStage::Failed);
    }

    #[tokio::test]
    async fn test_empty_store_has_no_baseline() {
        let fx = Fixture::new();
        let err = fx.engine(fx.options()).initialize().await.unwrap_err();
        assert!(matches!(err.cause(), InitError::NoSnapshotsFound));
        assert_eq!(err.stage(), Some(RestoreStage::FetchingBaseline));
        assert!(!fx.data_dir().exists());
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_verification() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        let delta = fx.store.put_delta(100, 150, &delta_events(), 2);
        let bytes = serde_json::to_vec(&delta_events()).unwrap();
        let offset = bytes.windows(4).position(|w| w == b"\"v2\"").unwrap() + 1;
        fx.store.corrupt(&delta.name, offset);

        let mut engine = fx.engine(fx.options());
        let err = engine.initialize().await.unwrap_err();
        match err.cause() {
            InitError::HashMismatch {
                snapshot,
                start_revision,
                end_revision,
                ..
            } => {
                assert_eq!(snapshot, "Incr-100-150");
                assert_eq!((*start_revision, *end_revision), (100, 150));
            }
            other => panic!("expected HashMismatch, got {:?}", other),
        }
        assert_eq!(err.stage(), Some(RestoreStage::ApplyingDeltas));
        assert_eq!(engine.stage(), RestoreStage::Failed);
        assert!(!fx.data_dir().exists());
        fx.assert_no_scratch_left();

        // The same corrupted bytes are accepted when the check is skipped.
        let mut options = fx.options();
        options.skip_hash_check = true;
        fx.engine(options).initialize().await.unwrap();
        assert_eq!(fx.restored_image().kvs["/a"].value, "w2");
    }

    #[tokio::test]
    async fn test_gap_in_chain() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        fx.store.put_delta(120, 150, &[DeltaEvent::put("/a", "v3", 150)], 2);

        let mut options = fx.options();
        options.strict_chain = true;
        let err = fx.engine(options).initialize().await.unwrap_err();
        match err.cause() {
            InitError::ChainGap { reached, target, .. } => assert_eq!((*reached, *target), (100, 150)),
            other => panic!("expected ChainGap, got {:?}", other),
        }
        assert!(!fx.data_dir().exists());

        let summary = restored(fx.engine(fx.options()).initialize().await.unwrap());
        assert_eq!(summary.revision, 100);
        assert_eq!(summary.snapshots_applied, 1);
        assert!(summary.truncated);
        assert_eq!(fx.restored_image().kvs["/a"].value, "v1");
    }

    #[tokio::test]
    async fn test_restore_up_to_stops_early() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        fx.store.put_delta(100, 150, &delta_events(), 2);
        fx.store.put_delta(150, 200, &[DeltaEvent::put("/d", "x", 170)], 3);

        let mut options = fx.options();
        options.restore_up_to = Some(150);
        let outcome = fx.engine(options).initialize().await.unwrap();
        assert!(matches!(
            outcome,
            InitOutcome::Restored(RestoreSummary { revision: 150, truncated: false, .. })
        ));
        assert!(!fx.restored_image().kvs.contains_key("/d"));
    }

    #[tokio::test]
    async fn test_failed_chunk_leaves_nothing_behind() {
        let fx = Fixture::new();
        let full = fx.store.put_full(&base_image(), 1);
        fx.store.fail_chunk(&full.name, 16, 100);

        let err = fx.engine(fx.options()).initialize().await.unwrap_err();
        assert!(matches!(
            err.cause(),
            InitError::ChunkFetchFailed { offset: 16, .. }
        ));
        assert!(!fx.data_dir().exists());
        fx.assert_no_scratch_left();
    }

    #[tokio::test]
    async fn test_forced_restore_replaces_valid_directory() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        fx.engine(fx.options()).initialize().await.unwrap();

        fx.store.put_delta(100, 150, &delta_events(), 2);
        let mut engine = fx.engine(fx.options());
        let outcome = engine.restore().await.unwrap();
        assert!(matches!(
            outcome,
            InitOutcome::Restored(RestoreSummary { revision: 150, .. })
        ));
        assert_eq!(fx.restored_image().revision, 150);
        assert!(!sibling(&fx.data_dir(), ".old").exists());
    }

    #[tokio::test]
    async fn test_corrupted_directory_is_rebuilt() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        let layout = DataLayout::new(fx.data_dir());
        std::fs::create_dir_all(layout.member_dir()).unwrap();
        std::fs::write(layout.identity_path(), b"{not json").unwrap();

        let outcome = fx.engine(fx.options()).initialize().await.unwrap();
        assert!(matches!(outcome, InitOutcome::Restored(_)));
        assert!(validator::validate(&fx.data_dir()).is_valid());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_restore() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let mut engine = fx.engine(fx.options()).with_shutdown(rx);
        let err = engine.initialize().await.unwrap_err();
        assert!(matches!(err.cause(), InitError::Cancelled));
        assert!(!fx.data_dir().exists());
        fx.assert_no_scratch_left();
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_store_is_contacted() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        let mut options = fx.options();
        options.max_fetchers = 0;
        let mut engine = fx.engine(options);
        assert!(matches!(
            engine.initialize().await,
            Err(InitError::InvalidOptions(_))
        ));
        assert_eq!(engine.stage(), RestoreStage::Failed);
        assert_eq!(fx.store.list_calls(), 0);
        assert!(matches!(
            engine.restore().await,
            Err(InitError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn test_valid_directory_ignores_restore_only_options() {
        let fx = Fixture::new();
        fx.store.put_full(&base_image(), 1);
        fx.engine(fx.options()).initialize().await.unwrap();

        let mut options = fx.options();
        options.cluster_urls =
            UrlsMap::parse("etcd-0=http://10.0.0.1:2380,etcd-1=http://10.0.0.2:2380").unwrap();
        options.peer_urls.clear();
        let mut engine = fx.engine(options);
        assert_eq!(engine.initialize().await.unwrap(), InitOutcome::AlreadyValid);
        assert_eq!(engine.stage(), RestoreStage::AlreadyValid);
    }

    #[tokio::test]
    async fn test_scratch_cleanup_after_success_and_drop() {
        let fx = Fixture::new();
        let mut scratch = Scratch::new(&fx.temp_dir(), &fx.data_dir());
        scratch.prepare().await.unwrap();
        std::fs::create_dir_all(&scratch.staging).unwrap();
        scratch.cleanup().await;
        fx.assert_no_scratch_left();

        let scratch = Scratch::new(&fx.temp_dir(), &fx.data_dir());
        scratch.prepare().await.unwrap();
        assert!(fx.temp_dir().join("fetch").is_dir());
        drop(scratch);
        fx.assert_no_scratch_left();
    }
}
