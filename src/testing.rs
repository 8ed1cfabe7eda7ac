//! In-memory snapshot store for unit tests.

use crate::content::{DeltaEvent, StateImage};
use crate::error::StoreError;
use crate::snapstore::{ByteStream, SnapshotStore};
use crate::types::{ByteRange, SnapshotKind, SnapshotMetadata};
use crate::verify::sha256_content_hash;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Inner {
    listing: Vec<SnapshotMetadata>,
    objects: HashMap<String, Vec<u8>>,
    /// Remaining injected failures per `(name, offset)`.
    failures: HashMap<(String, u64), usize>,
    fetched: Vec<String>,
}

/// Snapshot store holding its objects in memory and recording how it is used.
#[derive(Default)]
pub(crate) struct MemoryStore {
    inner: Mutex<Inner>,
    delay: Option<Duration>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every `get` by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Stores `content` under `name` and lists it with its SHA-256.
    pub fn put_raw(
        &self,
        name: &str,
        kind: SnapshotKind,
        start_revision: u64,
        end_revision: u64,
        content: Vec<u8>,
    ) -> SnapshotMetadata {
        self.put_at(name, kind, start_revision, end_revision, content, 1)
    }

    fn put_at(
        &self,
        name: &str,
        kind: SnapshotKind,
        start_revision: u64,
        end_revision: u64,
        content: Vec<u8>,
        created_on: i64,
    ) -> SnapshotMetadata {
        let meta = SnapshotMetadata {
            name: name.to_string(),
            kind,
            start_revision,
            end_revision,
            created_on,
            size: content.len() as u64,
            content_hash: Some(sha256_content_hash(&content)),
            compressed: false,
        };
        let mut inner = self.inner();
        inner.listing.push(meta.clone());
        inner.objects.insert(name.to_string(), content);
        meta
    }

    /// Stores a full snapshot of `image` named `Full-<revision>`.
    pub fn put_full(&self, image: &StateImage, created_on: i64) -> SnapshotMetadata {
        self.put_at(
            &format!("Full-{}", image.revision),
            SnapshotKind::Full,
            image.revision,
            image.revision,
            serde_json::to_vec(image).unwrap(),
            created_on,
        )
    }

    /// Stores a delta snapshot named `Incr-<start>-<end>`.
    pub fn put_delta(
        &self,
        start_revision: u64,
        end_revision: u64,
        events: &[DeltaEvent],
        created_on: i64,
    ) -> SnapshotMetadata {
        self.put_at(
            &format!("Incr-{}-{}", start_revision, end_revision),
            SnapshotKind::Delta,
            start_revision,
            end_revision,
            serde_json::to_vec(events).unwrap(),
            created_on,
        )
    }

    /// Flips one byte of a stored object without touching its listed hash.
    pub fn corrupt(&self, name: &str, offset: usize) {
        let mut inner = self.inner();
        let object = inner.objects.get_mut(name).unwrap();
        object[offset] ^= 0x01;
    }

    /// Makes the next `times` reads of `name` starting at `offset` fail.
    pub fn fail_chunk(&self, name: &str, offset: u64, times: usize) {
        self.inner()
            .failures
            .insert((name.to_string(), offset), times);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Names of fetched objects in the order their first chunk was requested.
    pub fn fetched_order(&self) -> Vec<String> {
        self.inner().fetched.clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner().listing.clone())
    }

    async fn get(&self, name: &str, range: Option<ByteRange>) -> Result<ByteStream, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner();
        if !inner.fetched.iter().any(|n| n == name) {
            inner.fetched.push(name.to_string());
        }
        let object = inner
            .objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let range = range.unwrap_or(0..object.len() as u64);

        if let Some(remaining) = inner.failures.get_mut(&(name.to_string(), range.start)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Io(std::io::Error::other("injected failure")));
            }
        }
        drop(inner);

        let slice = object[range.start as usize..range.end as usize].to_vec();
        let stream = futures_util::stream::iter(vec![Ok(Bytes::from(slice))]);
        Ok(stream.boxed())
    }
}
