//! Snapshot store contract and its backend adapters.
//!
//! Every backend exposes the same read-only capability: list the recorded
//! snapshots and stream (a byte range of) one of them. The restore engine only
//! ever talks to a `dyn SnapshotStore`.

mod http;
mod local;

pub use http::HttpSnapStore;
pub use local::LocalSnapStore;

use crate::error::StoreError;
use crate::types::{ByteRange, SnapshotMetadata, SnapstoreConfig, StoreProvider};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Name of the listing object inside a store prefix.
pub const INDEX_FILE: &str = "index.json";

/// Stream of bytes returned by [`SnapshotStore::get`].
pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// Read side of a snapshot store.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Lists every snapshot recorded in the store.
    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError>;

    /// Streams the object `name`, or only `range` of it when given.
    async fn get(&self, name: &str, range: Option<ByteRange>) -> Result<ByteStream, StoreError>;
}

/// Opens the adapter selected by `config.provider`.
pub fn open(config: &SnapstoreConfig) -> Result<Arc<dyn SnapshotStore>, StoreError> {
    let prefix = config.effective_prefix();
    let store: Arc<dyn SnapshotStore> = match config.provider {
        StoreProvider::Local => Arc::new(LocalSnapStore::new(
            std::path::Path::new(&config.container).join(prefix),
        )),
        StoreProvider::Http => Arc::new(HttpSnapStore::new(&config.container, &prefix)?),
    };
    Ok(store)
}
