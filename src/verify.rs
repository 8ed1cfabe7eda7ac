//! Content hash verification of fetched snapshots (SHA-256 or MD5).

use crate::error::InitError;
use crate::types::SnapshotMetadata;
use std::path::Path;
use tracing::{info, warn};

/// Digest algorithm named in a recorded content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    /// S3/R2 ETags of simple uploads are MD5 digests.
    Md5,
}

impl HashAlgorithm {
    fn prefix(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Md5 => "md5",
        }
    }
}

/// Splits a recorded hash such as `sha256:ab12...` into algorithm and hex digest.
///
/// A bare 32-character digest is treated as MD5 (an ETag), a bare 64-character
/// digest as SHA-256.
pub fn parse_content_hash(recorded: &str) -> Option<(HashAlgorithm, String)> {
    let recorded = recorded.trim().trim_matches('"');
    let (algorithm, digest) = match recorded.split_once(':') {
        Some(("sha256", digest)) => (HashAlgorithm::Sha256, digest),
        Some(("md5", digest)) => (HashAlgorithm::Md5, digest),
        Some(_) => return None,
        None if recorded.len() == 32 => (HashAlgorithm::Md5, recorded),
        None if recorded.len() == 64 => (HashAlgorithm::Sha256, recorded),
        None => return None,
    };
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((algorithm, digest.to_ascii_lowercase()))
}

/// Computes the digest of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
pub async fn compute_file_hash(path: &Path, algorithm: HashAlgorithm) -> Result<String, InitError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
        .await
        .map_err(|e| InitError::Io(std::io::Error::other(format!("Task join error: {}", e))))?
}

fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String, InitError> {
    use std::io::Read;

    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
    let mut buffer = vec![0u8; 1024 * 1024];

    match algorithm {
        HashAlgorithm::Sha256 => {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
        HashAlgorithm::Md5 => {
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            loop {
                let n = reader.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
    }
}

/// Verifies a fetched snapshot file against the hash recorded in the listing.
///
/// With `skip_hash_check` the comparison is skipped, but never silently: the
/// skipped snapshot is logged at warn level.
pub async fn verify_file(
    path: &Path,
    snapshot: &SnapshotMetadata,
    skip_hash_check: bool,
) -> Result<(), InitError> {
    if skip_hash_check {
        warn!(
            "⚠️  Skipping hash verification of snapshot {} (skip-hash-check is set)",
            snapshot
        );
        return Ok(());
    }

    let mismatch = |expected: String, actual: String| InitError::HashMismatch {
        snapshot: snapshot.name.clone(),
        start_revision: snapshot.start_revision,
        end_revision: snapshot.end_revision,
        expected,
        actual,
    };

    let recorded = snapshot
        .content_hash
        .as_deref()
        .ok_or_else(|| mismatch("<no recorded hash>".to_string(), "<not computed>".to_string()))?;
    let (algorithm, expected) = parse_content_hash(recorded).ok_or_else(|| {
        mismatch(
            format!("<unrecognized hash {:?}>", recorded),
            "<not computed>".to_string(),
        )
    })?;

    info!("🔍 Verifying {} of {}", algorithm.prefix(), snapshot);
    let actual = compute_file_hash(path, algorithm).await?;
    if actual != expected {
        return Err(mismatch(
            format!("{}:{}", algorithm.prefix(), expected),
            format!("{}:{}", algorithm.prefix(), actual),
        ));
    }
    info!("✅ Hash verified for {}", snapshot);
    Ok(())
}

/// Formats the SHA-256 of `bytes` the way listings record it.
pub fn sha256_content_hash(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{:x}", Sha256::digest(bytes))
}
