//! On-disk layout of a bootstrapped data directory.
//!
//! ```text
//! <data_dir>/member/identity.json
//! <data_dir>/member/snap/db
//! <data_dir>/member/wal/0000000000000000-0000000000000000.wal
//! ```
//!
//! The state file is `[version u32][payload length u64][payload][sha256][magic u64]`,
//! all integers little-endian. WAL segments are a sequence of
//! `[payload length u32][crc32 u32][payload]` records.

use crate::content::StateImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version of the identity file and state file format written by this crate.
pub const LAYOUT_VERSION: u32 = 1;

/// Magic number stored in the last 8 bytes of the state file.
///
/// Value: 0x736e617067756172 ("snapguar" in ASCII)
pub const STATE_MAGIC_NUMBER: u64 = 0x736e_6170_6775_6172;

const STATE_HEADER_LEN: usize = 4 + 8;
const STATE_FOOTER_LEN: usize = 32 + 8;

/// Records larger than this are treated as corruption rather than allocated.
const MAX_WAL_RECORD_LEN: u32 = 64 * 1024 * 1024;

const WAL_EXTENSION: &str = "wal";

/// Reasons an artifact fails to decode.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{0}")]
    Corrupted(String),
    #[error("unsupported format version {found} (expected {})", LAYOUT_VERSION)]
    VersionMismatch { found: u32 },
}

/// Paths of the artifacts inside a data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn member_dir(&self) -> PathBuf {
        self.root.join("member")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.member_dir().join("identity.json")
    }

    pub fn snap_dir(&self) -> PathBuf {
        self.member_dir().join("snap")
    }

    pub fn db_path(&self) -> PathBuf {
        self.snap_dir().join("db")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.member_dir().join("wal")
    }

    pub fn wal_segment_path(&self, seq: u64, index: u64) -> PathBuf {
        self.wal_dir().join(wal_segment_name(seq, index))
    }
}

/// File name of a WAL segment: `<seq>-<index>.wal`, both 16 hex digits.
pub fn wal_segment_name(seq: u64, index: u64) -> String {
    format!("{:016x}-{:016x}.{}", seq, index, WAL_EXTENSION)
}

/// Parses a WAL segment name back into `(seq, index)`.
pub fn parse_wal_segment_name(name: &str) -> Option<(u64, u64)> {
    let stem = name.strip_suffix(".wal")?;
    let (seq, index) = stem.split_once('-')?;
    if seq.len() != 16 || index.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(seq, 16).ok()?,
        u64::from_str_radix(index, 16).ok()?,
    ))
}

/// Identity of the member owning a data directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MemberIdentity {
    pub version: u32,
    pub name: String,
    pub member_id: u64,
    pub cluster_id: u64,
}

/// A record of the WAL segment written at bootstrap.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalRecord {
    /// Identity of the member and cluster owning the log.
    Metadata { member_id: u64, cluster_id: u64 },
    /// Parameters for founding the cluster.
    Bootstrap {
        name: String,
        initial_cluster: String,
        cluster_token: String,
        peer_urls: Vec<String>,
    },
    /// The state file holds the store at this revision.
    Snapshot { revision: u64 },
}

/// Encodes a state image into the state file format.
pub fn encode_state_file(image: &StateImage) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(image)?;
    let mut out = Vec::with_capacity(STATE_HEADER_LEN + payload.len() + STATE_FOOTER_LEN);
    out.extend_from_slice(&LAYOUT_VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out.extend_from_slice(&STATE_MAGIC_NUMBER.to_le_bytes());
    Ok(out)
}

/// Decodes and checks a state file.
pub fn decode_state_file(bytes: &[u8]) -> Result<StateImage, LayoutError> {
    if bytes.len() < STATE_HEADER_LEN + STATE_FOOTER_LEN {
        return Err(LayoutError::Corrupted(format!(
            "state file too small ({} bytes)",
            bytes.len()
        )));
    }

    // Magic number sits in the last 8 bytes
    let (body, magic) = bytes.split_at(bytes.len() - 8);
    let magic = u64::from_le_bytes(magic.try_into().unwrap_or([0; 8]));
    if magic != STATE_MAGIC_NUMBER {
        return Err(LayoutError::Corrupted(format!(
            "bad state file magic number {:#018x}",
            magic
        )));
    }

    let version = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    if version != LAYOUT_VERSION {
        return Err(LayoutError::VersionMismatch { found: version });
    }

    let (content, digest) = body.split_at(body.len() - 32);
    if Sha256::digest(content).as_slice() != digest {
        return Err(LayoutError::Corrupted("state file checksum mismatch".to_string()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&content[4..STATE_HEADER_LEN]);
    let payload = &content[STATE_HEADER_LEN..];
    if u64::from_le_bytes(len_bytes) != payload.len() as u64 {
        return Err(LayoutError::Corrupted(
            "state file payload length does not match header".to_string(),
        ));
    }

    serde_json::from_slice(payload)
        .map_err(|e| LayoutError::Corrupted(format!("state file payload is malformed: {}", e)))
}

/// Encodes records into a WAL segment.
pub fn encode_wal(records: &[WalRecord]) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    for record in records {
        let payload = serde_json::to_vec(record)?;
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
    }
    Ok(out)
}

/// Decodes a WAL segment, checking every record's CRC.
pub fn decode_wal(bytes: &[u8]) -> Result<Vec<WalRecord>, LayoutError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < 8 {
            return Err(LayoutError::Corrupted(format!(
                "truncated WAL record header at offset {}",
                offset
            )));
        }
        let len = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        let crc = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        if len > MAX_WAL_RECORD_LEN {
            return Err(LayoutError::Corrupted(format!(
                "WAL record at offset {} claims {} bytes",
                offset, len
            )));
        }
        let start = offset + 8;
        let end = start + len as usize;
        if end > bytes.len() {
            return Err(LayoutError::Corrupted(format!(
                "truncated WAL record at offset {}",
                offset
            )));
        }
        let payload = &bytes[start..end];
        if crc32fast::hash(payload) != crc {
            return Err(LayoutError::Corrupted(format!(
                "WAL record checksum mismatch at offset {}",
                offset
            )));
        }
        let record = serde_json::from_slice(payload).map_err(|e| {
            LayoutError::Corrupted(format!("malformed WAL record at offset {}: {}", offset, e))
        })?;
        records.push(record);
        offset = end;
    }
    Ok(records)
}
