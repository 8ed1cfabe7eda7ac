//! Snapshot store backed by a local directory.

use super::{ByteStream, SnapshotStore, INDEX_FILE};
use crate::error::StoreError;
use crate::types::{ByteRange, SnapshotMetadata};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Reads snapshots from `<root>/<name>` and the listing from `<root>/index.json`.
#[derive(Debug, Clone)]
pub struct LocalSnapStore {
    root: PathBuf,
}

impl LocalSnapStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        // Names come from the listing; refuse anything that escapes the root.
        if name.is_empty() || name.contains("..") || Path::new(name).is_absolute() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapStore {
    async fn list(&self) -> Result<Vec<SnapshotMetadata>, StoreError> {
        let index = self.root.join(INDEX_FILE);
        let content = match tokio::fs::read(&index).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot listing at {:?}", index);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&content)?)
    }

    async fn get(&self, name: &str, range: Option<ByteRange>) -> Result<ByteStream, StoreError> {
        let path = self.object_path(name)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        let range = range.unwrap_or(0..len);
        if range.end > len {
            return Err(StoreError::LengthMismatch {
                name: name.to_string(),
                expected: range.end,
                actual: len,
            });
        }
        file.seek(SeekFrom::Start(range.start)).await?;

        let reader = file.take(range.end - range.start);
        let stream = futures_util::stream::unfold(reader, |mut reader| async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            match reader.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(bytes::Bytes::from(buf)), reader))
                }
                Err(e) => Some((Err(StoreError::Io(e)), reader)),
            }
        });
        Ok(stream.boxed())
    }
}
