//! Bounded-concurrency chunk fetching of snapshot objects.

use crate::error::{InitError, StoreError};
use crate::snapstore::SnapshotStore;
use crate::types::{ByteRange, RestoreOptions, SnapshotChain, SnapshotMetadata};
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, error, info, warn};

/// Upper bound for a single retry delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Knobs of the chunk fetcher pool.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Maximum number of chunks of one snapshot in flight at once.
    pub max_fetchers: usize,
    pub chunk_size: u64,
    /// Retries per chunk after the first failed attempt.
    pub retries: usize,
    pub backoff: Duration,
}

impl From<&RestoreOptions> for FetchSettings {
    fn from(options: &RestoreOptions) -> Self {
        Self {
            max_fetchers: options.max_fetchers.max(1),
            chunk_size: options.chunk_size.max(1),
            retries: options.fetch_retries,
            backoff: options.fetch_backoff,
        }
    }
}

/// One chunk of a snapshot assigned to a worker.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub snapshot: String,
    pub range: ByteRange,
    pub dest: PathBuf,
}

/// What a chunk worker achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub range: ByteRange,
    pub bytes: u64,
    pub attempts: usize,
}

/// Summary of a completed snapshot fetch.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: usize,
    /// Highest number of chunks that were in flight at the same time.
    pub peak_in_flight: usize,
}

/// Progress shared by the workers of one snapshot fetch.
struct FetchProgress {
    bytes_done: u64,
    chunks_done: usize,
    in_flight: usize,
    peak_in_flight: usize,
    pb: indicatif::ProgressBar,
}

impl FetchProgress {
    fn new(snapshot: &SnapshotMetadata) -> Self {
        let pb = if atty::is(atty::Stream::Stderr) {
            let pb = indicatif::ProgressBar::new(snapshot.size);
            pb.set_style(
                indicatif::ProgressStyle::default_bar()
                    .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")
                    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
                    .progress_chars("█▓▒░ "),
            );
            pb
        } else {
            indicatif::ProgressBar::hidden()
        };
        pb.set_message(format!("📦 Fetching {}", snapshot));
        Self {
            bytes_done: 0,
            chunks_done: 0,
            in_flight: 0,
            peak_in_flight: 0,
            pb,
        }
    }

    fn start_chunk(&mut self) {
        self.in_flight += 1;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight);
    }

    fn finish_chunk(&mut self, bytes: Option<u64>) {
        self.in_flight -= 1;
        if let Some(bytes) = bytes {
            self.bytes_done += bytes;
            self.chunks_done += 1;
            self.pb.inc(bytes);
        }
    }
}

fn lock(progress: &Mutex<FetchProgress>) -> MutexGuard<'_, FetchProgress> {
    progress.lock().unwrap_or_else(|e| e.into_inner())
}

/// Splits `size` bytes into consecutive ranges of at most `chunk_size` bytes.
pub fn split_ranges(size: u64, chunk_size: u64) -> Vec<ByteRange> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < size {
        let end = size.min(start.saturating_add(chunk_size));
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Resolves once `shutdown` carries `true`; never resolves if the sender is gone.
pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Local file name of a fetched snapshot.
fn local_name(snapshot: &SnapshotMetadata) -> String {
    snapshot.name.replace(['/', '\\'], "_")
}

/// Fetches every snapshot of `chain` into `dest_dir`, strictly in chain order.
pub async fn fetch_chain(
    store: &Arc<dyn SnapshotStore>,
    chain: &SnapshotChain,
    dest_dir: &Path,
    settings: &FetchSettings,
    shutdown: &watch::Receiver<bool>,
) -> Result<Vec<PathBuf>, InitError> {
    let mut paths = Vec::with_capacity(chain.len());
    for snapshot in &chain.snapshots {
        let report = fetch_snapshot(store, snapshot, dest_dir, settings, shutdown).await?;
        paths.push(report.path);
    }
    Ok(paths)
}

/// Fetches one snapshot into `dest_dir` with up to `settings.max_fetchers` chunks in flight.
///
/// Bytes are written to `<dest_dir>/<name>.part` and renamed to
/// `<dest_dir>/<name>` only once every chunk has landed. On any failure or
/// shutdown the remaining workers are aborted and the part file is removed.
pub async fn fetch_snapshot(
    store: &Arc<dyn SnapshotStore>,
    snapshot: &SnapshotMetadata,
    dest_dir: &Path,
    settings: &FetchSettings,
    shutdown: &watch::Receiver<bool>,
) -> Result<FetchReport, InitError> {
    if *shutdown.borrow() {
        return Err(InitError::Cancelled);
    }

    tokio::fs::create_dir_all(dest_dir).await?;
    let final_path = dest_dir.join(local_name(snapshot));
    let part_path = dest_dir.join(format!("{}.part", local_name(snapshot)));

    {
        let file = tokio::fs::File::create(&part_path).await?;
        file.set_len(snapshot.size).await?;
    }

    let ranges = split_ranges(snapshot.size, settings.chunk_size);
    info!(
        "⬇️  Fetching {} ({} bytes in {} chunk(s), {} fetcher(s))",
        snapshot,
        snapshot.size,
        ranges.len(),
        settings.max_fetchers
    );

    let progress = Arc::new(Mutex::new(FetchProgress::new(snapshot)));
    let result = run_workers(
        store,
        snapshot,
        &part_path,
        ranges,
        settings,
        &progress,
        shutdown,
    )
    .await;

    let (bytes, chunks, peak_in_flight) = {
        let progress = lock(&progress);
        (progress.bytes_done, progress.chunks_done, progress.peak_in_flight)
    };

    if let Err(e) = result {
        lock(&progress).pb.abandon_with_message(format!("❌ Fetch of {} failed", snapshot));
        discard(&part_path).await;
        return Err(e);
    }

    if let Err(e) = commit(&part_path, &final_path).await {
        discard(&part_path).await;
        return Err(e.into());
    }

    lock(&progress).pb.finish_with_message(format!("✅ Fetched {}", snapshot));
    debug!("Committed {:?} (peak {} chunk(s) in flight)", final_path, peak_in_flight);

    Ok(FetchReport {
        path: final_path,
        bytes,
        chunks,
        peak_in_flight,
    })
}

async fn run_workers(
    store: &Arc<dyn SnapshotStore>,
    snapshot: &SnapshotMetadata,
    part_path: &Path,
    ranges: Vec<ByteRange>,
    settings: &FetchSettings,
    progress: &Arc<Mutex<FetchProgress>>,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), InitError> {
    // Create semaphore to limit concurrent chunk fetches
    let semaphore = Arc::new(Semaphore::new(settings.max_fetchers));
    let mut tasks = JoinSet::new();

    for range in ranges {
        let task = FetchTask {
            snapshot: snapshot.name.clone(),
            range,
            dest: part_path.to_path_buf(),
        };
        let semaphore = Arc::clone(&semaphore);
        let progress = Arc::clone(progress);
        let store = Arc::clone(store);
        let settings = settings.clone();
        let meta = snapshot.clone();

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| InitError::Cancelled)?;

            lock(&progress).start_chunk();
            let result = fetch_chunk(store.as_ref(), &task, &settings).await;
            lock(&progress).finish_chunk(result.as_ref().ok().map(|o| o.bytes));

            result.map_err(|(source, attempts)| {
                error!(
                    "Chunk {}..{} of {} failed after {} attempt(s): {}",
                    task.range.start, task.range.end, meta, attempts, source
                );
                InitError::ChunkFetchFailed {
                    snapshot: meta.name.clone(),
                    start_revision: meta.start_revision,
                    end_revision: meta.end_revision,
                    offset: task.range.start,
                    end: task.range.end,
                    source,
                }
            })
        });
    }

    let shutdown_signal = wait_for_shutdown(shutdown.clone());
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                None => return Ok(()),
                Some(Ok(Ok(outcome))) => {
                    debug!(
                        "Chunk {}..{} of {} done after {} attempt(s)",
                        outcome.range.start, outcome.range.end, snapshot.name, outcome.attempts
                    );
                }
                Some(Ok(Err(e))) => {
                    abort_all(&mut tasks).await;
                    return Err(e);
                }
                Some(Err(e)) => {
                    abort_all(&mut tasks).await;
                    return Err(InitError::Io(std::io::Error::other(format!(
                        "Task join error: {}",
                        e
                    ))));
                }
            },
            _ = &mut shutdown_signal => {
                warn!("Shutdown requested, aborting fetch of {}", snapshot);
                abort_all(&mut tasks).await;
                return Err(InitError::Cancelled);
            }
        }
    }
}

/// Aborts the remaining workers and waits until none of them touches the part file.
async fn abort_all(tasks: &mut JoinSet<Result<ChunkOutcome, InitError>>) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}

/// Fetches one chunk with bounded retries; returns the last error and attempt count on failure.
async fn fetch_chunk(
    store: &dyn SnapshotStore,
    task: &FetchTask,
    settings: &FetchSettings,
) -> Result<ChunkOutcome, (StoreError, usize)> {
    let retry_strategy = ExponentialBackoff::from_millis(2)
        .factor((settings.backoff.as_millis() as u64 / 2).max(1))
        .map(jitter)
        .map(|delay| delay.min(MAX_RETRY_DELAY))
        .take(settings.retries);

    let attempts = std::sync::atomic::AtomicUsize::new(0);
    let result = Retry::spawn(retry_strategy, || {
        let attempts = &attempts;
        async move {
            let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            match write_range(store, task).await {
                Ok(bytes) => Ok(bytes),
                Err(StoreError::NotFound(name)) => {
                    RetryError::to_permanent(StoreError::NotFound(name))
                }
                Err(e) => {
                    warn!(
                        "Attempt {} for bytes {}..{} of {} failed: {}",
                        attempt, task.range.start, task.range.end, task.snapshot, e
                    );
                    RetryError::to_transient(e)
                }
            }
        }
    })
    .await;

    let attempts = attempts.load(std::sync::atomic::Ordering::SeqCst);
    match result {
        Ok(bytes) => Ok(ChunkOutcome {
            range: task.range.clone(),
            bytes,
            attempts,
        }),
        Err(e) => Err((e, attempts)),
    }
}

/// Streams one range from the store into its offset of the destination file.
async fn write_range(store: &dyn SnapshotStore, task: &FetchTask) -> Result<u64, StoreError> {
    let expected = task.range.end - task.range.start;
    let mut stream = store.get(&task.snapshot, Some(task.range.clone())).await?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&task.dest)
        .await?;
    file.seek(SeekFrom::Start(task.range.start)).await?;
    let mut writer = BufWriter::new(file);

    let mut written = 0u64;
    while let Some(piece) = stream.next().await {
        let piece = piece?;
        if written + piece.len() as u64 > expected {
            return Err(StoreError::LengthMismatch {
                name: task.snapshot.clone(),
                expected,
                actual: written + piece.len() as u64,
            });
        }
        writer.write_all(&piece).await?;
        written += piece.len() as u64;
    }
    writer.flush().await?;

    if written != expected {
        return Err(StoreError::LengthMismatch {
            name: task.snapshot.clone(),
            expected,
            actual: written,
        });
    }
    Ok(written)
}

async fn commit(part_path: &Path, final_path: &Path) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(part_path).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(part_path, final_path).await
}

async fn discard(part_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(part_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial download {:?}: {}", part_path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use crate::types::SnapshotKind;

    fn settings(max_fetchers: usize, chunk_size: u64) -> FetchSettings {
        FetchSettings {
            max_fetchers,
            chunk_size,
            retries: 2,
            backoff: Duration::from_millis(2),
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(split_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(split_ranges(8, 4), vec![0..4, 4..8]);
        assert!(split_ranges(0, 4).is_empty());
        assert_eq!(split_ranges(3, 0), vec![0..1, 1..2, 2..3]);
    }

    #[tokio::test]
    async fn test_fetch_reassembles_chunks_in_order() {
        let store = Arc::new(MemoryStore::new());
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let meta = store.put_raw("Full-1", SnapshotKind::Full, 1, 1, content.clone());
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();

        let dir = tempfile::tempdir().unwrap();
        let report = fetch_snapshot(&dyn_store, &meta, dir.path(), &settings(3, 64), &no_shutdown())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&report.path).unwrap(), content);
        assert_eq!(report.chunks, 16);
        assert_eq!(report.bytes, 1000);
        assert_eq!(leftovers(dir.path()), vec!["Full-1".to_string()]);
    }

    #[tokio::test]
    async fn test_in_flight_never_exceeds_max_fetchers() {
        let store = Arc::new(MemoryStore::new().with_delay(Duration::from_millis(15)));
        let meta = store.put_raw("Full-1", SnapshotKind::Full, 1, 1, vec![7u8; 4096]);
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();

        let dir = tempfile::tempdir().unwrap();
        let report = fetch_snapshot(&dyn_store, &meta, dir.path(), &settings(3, 128), &no_shutdown())
            .await
            .unwrap();

        assert!(report.peak_in_flight <= 3);
        assert!(store.peak_in_flight() <= 3);
        assert!(store.peak_in_flight() >= 2, "chunks should overlap");
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let meta = store.put_raw("Full-1", SnapshotKind::Full, 1, 1, vec![1u8; 300]);
        store.fail_chunk("Full-1", 100, 2);
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();

        let dir = tempfile::tempdir().unwrap();
        let report = fetch_snapshot(&dyn_store, &meta, dir.path(), &settings(2, 100), &no_shutdown())
            .await
            .unwrap();
        assert_eq!(std::fs::read(report.path).unwrap(), vec![1u8; 300]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_discard_part_file() {
        let store = Arc::new(MemoryStore::new());
        let meta = store.put_raw("Full-1", SnapshotKind::Full, 1, 1, vec![1u8; 300]);
        store.fail_chunk("Full-1", 200, 10);
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();

        let dir = tempfile::tempdir().unwrap();
        let err = fetch_snapshot(&dyn_store, &meta, dir.path(), &settings(2, 100), &no_shutdown())
            .await
            .unwrap_err();

        match err {
            InitError::ChunkFetchFailed { offset, end, .. } => assert_eq!((offset, end), (200, 300)),
            other => panic!("expected chunk failure, got {:?}", other),
        }
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_aborts_fetch() {
        let store = Arc::new(MemoryStore::new().with_delay(Duration::from_millis(200)));
        let meta = store.put_raw("Full-1", SnapshotKind::Full, 1, 1, vec![1u8; 1000]);
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();
        let (tx, rx) = watch::channel(false);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let fetch = tokio::spawn(async move {
            fetch_snapshot(&dyn_store, &meta, &path, &settings(2, 100), &rx).await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        assert!(matches!(fetch.await.unwrap(), Err(InitError::Cancelled)));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_chain_keeps_chain_order() {
        let store = Arc::new(MemoryStore::new());
        let full = store.put_raw("Full-100", SnapshotKind::Full, 100, 100, b"base".to_vec());
        let delta = store.put_raw("Incr-100-150", SnapshotKind::Delta, 100, 150, b"delta".to_vec());
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();
        let chain = SnapshotChain {
            snapshots: vec![full, delta],
            target_revision: 150,
        };

        let dir = tempfile::tempdir().unwrap();
        let paths = fetch_chain(&dyn_store, &chain, dir.path(), &settings(4, 2), &no_shutdown())
            .await
            .unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"base");
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"delta");
        assert_eq!(
            store.fetched_order(),
            vec!["Full-100".to_string(), "Incr-100-150".to_string()]
        );
    }

    #[tokio::test]
    async fn test_empty_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let meta = store.put_raw("Full-0", SnapshotKind::Full, 0, 0, Vec::new());
        let dyn_store: Arc<dyn SnapshotStore> = store.clone();

        let dir = tempfile::tempdir().unwrap();
        let report = fetch_snapshot(&dyn_store, &meta, dir.path(), &settings(2, 100), &no_shutdown())
            .await
            .unwrap();
        assert_eq!(report.chunks, 0);
        assert!(std::fs::read(report.path).unwrap().is_empty());
    }
}
