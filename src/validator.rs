//! Read-only validation of a local data directory.

use crate::error::InitError;
use crate::layout::{
    decode_state_file, decode_wal, parse_wal_segment_name, DataLayout, LayoutError,
    MemberIdentity, WalRecord, LAYOUT_VERSION,
};
use crate::types::DirectoryState;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Outcome of validating a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub path: PathBuf,
    pub state: DirectoryState,
    pub detail: String,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.state == DirectoryState::Valid
    }

    /// Turns an invalid directory into [`InitError::DataDirCorrupted`].
    pub fn into_result(self) -> Result<(), InitError> {
        if self.is_valid() {
            return Ok(());
        }
        Err(self.into_error())
    }

    pub(crate) fn into_error(self) -> InitError {
        InitError::DataDirCorrupted {
            path: self.path,
            state: self.state,
            detail: self.detail,
        }
    }
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data directory {:?} is {}: {}", self.path, self.state, self.detail)
    }
}

type Check<T> = Result<T, (DirectoryState, String)>;

fn corrupted<T>(detail: impl Into<String>) -> Check<T> {
    Err((DirectoryState::Corrupted, detail.into()))
}

impl From<LayoutError> for (DirectoryState, String) {
    fn from(err: LayoutError) -> Self {
        match err {
            LayoutError::Corrupted(_) => (DirectoryState::Corrupted, err.to_string()),
            LayoutError::VersionMismatch { .. } => (DirectoryState::VersionMismatch, err.to_string()),
        }
    }
}

/// Validates the data directory at `path` without modifying anything.
pub fn validate(path: &Path) -> Validation {
    let (state, detail) = match check_data_dir(path) {
        Ok(revision) => (
            DirectoryState::Valid,
            format!("state file at revision {}", revision),
        ),
        Err((state, detail)) => (state, detail),
    };
    debug!("Validated {:?}: {} ({})", path, state, detail);
    Validation {
        path: path.to_path_buf(),
        state,
        detail,
    }
}

fn check_data_dir(path: &Path) -> Check<u64> {
    let layout = DataLayout::new(path);

    let mut entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err((DirectoryState::Missing, "directory does not exist".to_string()))
        }
        Err(e) => return corrupted(format!("cannot read directory: {}", e)),
    };
    if entries.next().is_none() {
        return Err((DirectoryState::Missing, "directory is empty".to_string()));
    }
    if !layout.member_dir().is_dir() {
        return Err((DirectoryState::Missing, "member directory does not exist".to_string()));
    }

    let identity = check_identity(&layout)?;
    let revision = check_state_file(&layout)?;
    check_wal(&layout, &identity)?;
    Ok(revision)
}

fn read_file(path: &Path) -> Check<Vec<u8>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => return corrupted(format!("cannot open {:?}: {}", path, e)),
    };
    let mut bytes = Vec::new();
    if let Err(e) = file.read_to_end(&mut bytes) {
        return corrupted(format!("cannot read {:?}: {}", path, e));
    }
    Ok(bytes)
}

fn check_identity(layout: &DataLayout) -> Check<MemberIdentity> {
    let bytes = read_file(&layout.identity_path())?;
    let identity: MemberIdentity = match serde_json::from_slice(&bytes) {
        Ok(identity) => identity,
        Err(e) => return corrupted(format!("member identity is malformed: {}", e)),
    };
    if identity.version != LAYOUT_VERSION {
        return Err((
            DirectoryState::VersionMismatch,
            format!(
                "member identity has version {} (expected {})",
                identity.version, LAYOUT_VERSION
            ),
        ));
    }
    Ok(identity)
}

fn check_state_file(layout: &DataLayout) -> Check<u64> {
    let bytes = read_file(&layout.db_path())?;
    let image = decode_state_file(&bytes)?;
    Ok(image.revision)
}

fn check_wal(layout: &DataLayout, identity: &MemberIdentity) -> Check<()> {
    let entries = match std::fs::read_dir(layout.wal_dir()) {
        Ok(entries) => entries,
        Err(e) => return corrupted(format!("cannot read WAL directory: {}", e)),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => return corrupted(format!("cannot read WAL directory: {}", e)),
        };
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(position) = parse_wal_segment_name(name) {
            segments.push((position, entry.path()));
        }
    }
    if segments.is_empty() {
        return corrupted("no WAL segments found");
    }
    segments.sort();

    for (i, (_, path)) in segments.iter().enumerate() {
        let records = decode_wal(&read_file(path)?).map_err(|e| {
            let (state, detail) = <(DirectoryState, String)>::from(e);
            (state, format!("{:?}: {}", path, detail))
        })?;
        if i == 0 {
            match records.first() {
                Some(WalRecord::Metadata { member_id, .. }) if *member_id == identity.member_id => {}
                Some(WalRecord::Metadata { member_id, .. }) => {
                    return corrupted(format!(
                        "WAL belongs to member {:016x}, identity names {:016x}",
                        member_id, identity.member_id
                    ))
                }
                _ => return corrupted("first WAL segment does not start with a metadata record"),
            }
        }
    }
    Ok(())
}
