//! Decoding of fetched snapshot bytes and application of deltas.

use crate::error::InitError;
use crate::types::{SnapshotKind, SnapshotMetadata};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// A key as stored in the state image.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub value: String,
    pub create_revision: u64,
    pub mod_revision: u64,
    pub version: u64,
}

/// Point-in-time image of the key space, as carried by a full snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StateImage {
    pub revision: u64,
    pub kvs: BTreeMap<String, KeyValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

/// One mutation recorded in a delta snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeltaEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub revision: u64,
}

impl DeltaEvent {
    pub fn put(key: &str, value: &str, revision: u64) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.to_string(),
            value: Some(value.to_string()),
            revision,
        }
    }

    pub fn delete(key: &str, revision: u64) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.to_string(),
            value: None,
            revision,
        }
    }
}

fn invalid(snapshot: &SnapshotMetadata, reason: impl Into<String>) -> InitError {
    InitError::SnapshotContent {
        snapshot: snapshot.name.clone(),
        start_revision: snapshot.start_revision,
        end_revision: snapshot.end_revision,
        reason: reason.into(),
    }
}

/// Reads a fetched snapshot file, decompressing it when the listing says so.
pub async fn read_snapshot(path: &Path, snapshot: &SnapshotMetadata) -> Result<Vec<u8>, InitError> {
    let path = path.to_path_buf();
    let snapshot = snapshot.clone();

    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(4 * 1024 * 1024, file);
        let mut buffer = Vec::new();
        if snapshot.compressed {
            GzDecoder::new(reader)
                .read_to_end(&mut buffer)
                .map_err(|e| invalid(&snapshot, format!("gzip decompression failed: {}", e)))?;
        } else {
            reader.read_to_end(&mut buffer)?;
        }
        Ok::<Vec<u8>, InitError>(buffer)
    })
    .await
    .map_err(|e| InitError::Io(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Decodes the image carried by a full snapshot.
pub fn decode_full(bytes: &[u8], snapshot: &SnapshotMetadata) -> Result<StateImage, InitError> {
    if snapshot.kind != SnapshotKind::Full {
        return Err(invalid(snapshot, "expected a full snapshot as chain baseline"));
    }
    let image: StateImage = serde_json::from_slice(bytes)
        .map_err(|e| invalid(snapshot, format!("malformed state image: {}", e)))?;
    if image.revision != snapshot.end_revision {
        return Err(invalid(
            snapshot,
            format!(
                "image is at revision {} but the listing records {}",
                image.revision, snapshot.end_revision
            ),
        ));
    }
    Ok(image)
}

/// Decodes the events carried by a delta snapshot.
pub fn decode_delta(bytes: &[u8], snapshot: &SnapshotMetadata) -> Result<Vec<DeltaEvent>, InitError> {
    if snapshot.kind != SnapshotKind::Delta {
        return Err(invalid(snapshot, "expected a delta snapshot"));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid(snapshot, format!("malformed events: {}", e)))
}

/// Applies a delta's events to `image` and moves it to the delta's end revision.
///
/// The image must sit at the delta's start revision. Events must carry
/// revisions inside `(start, end]` in non-decreasing order. On error the
/// image is left untouched.
pub fn apply_delta(
    image: &mut StateImage,
    snapshot: &SnapshotMetadata,
    events: &[DeltaEvent],
) -> Result<(), InitError> {
    if image.revision != snapshot.start_revision {
        return Err(invalid(
            snapshot,
            format!(
                "cannot apply on top of revision {}",
                image.revision
            ),
        ));
    }

    let mut next = image.kvs.clone();
    let mut last = snapshot.start_revision;
    for event in events {
        if event.revision <= snapshot.start_revision || event.revision > snapshot.end_revision {
            return Err(invalid(
                snapshot,
                format!("event for {} at revision {} is outside the snapshot range", event.key, event.revision),
            ));
        }
        if event.revision < last {
            return Err(invalid(
                snapshot,
                format!("event for {} at revision {} goes back from {}", event.key, event.revision, last),
            ));
        }
        last = event.revision;

        match event.kind {
            EventKind::Put => {
                let value = event
                    .value
                    .clone()
                    .ok_or_else(|| invalid(snapshot, format!("put of {} carries no value", event.key)))?;
                next.entry(event.key.clone())
                    .and_modify(|kv| {
                        kv.value = value.clone();
                        kv.mod_revision = event.revision;
                        kv.version += 1;
                    })
                    .or_insert_with(|| KeyValue {
                        value: value.clone(),
                        create_revision: event.revision,
                        mod_revision: event.revision,
                        version: 1,
                    });
            }
            EventKind::Delete => {
                next.remove(&event.key);
            }
        }
    }

    image.kvs = next;
    image.revision = snapshot.end_revision;
    Ok(())
}
