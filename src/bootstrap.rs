//! Writing the restored data directory and handing it over to the engine.

use crate::cluster::{cluster_id, member_id};
use crate::content::StateImage;
use crate::error::InitError;
use crate::layout::{encode_state_file, encode_wal, DataLayout, MemberIdentity, WalRecord, LAYOUT_VERSION};
use crate::types::RestoreOptions;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Identity of the single-member cluster a restore founds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapInfo {
    pub member_id: u64,
    pub cluster_id: u64,
    /// `name=url,...`, sorted.
    pub initial_cluster: String,
    pub revision: u64,
}

impl BootstrapInfo {
    pub fn new(options: &RestoreOptions, revision: u64) -> Self {
        let member_id = member_id(&options.name, &options.peer_urls, &options.cluster_token);
        Self {
            member_id,
            cluster_id: cluster_id(member_id, &options.cluster_token),
            initial_cluster: options.cluster_urls.initial_cluster(),
            revision,
        }
    }
}

/// Writes a complete data directory for `image` under `staging`.
///
/// The identity file is written last, so a directory interrupted half-way
/// never validates.
///
/// # Arguments
/// * `staging` - Directory to populate; it must not contain a previous layout
/// * `image` - Restored key space
/// * `options` - Member name, peer URLs and cluster token of the new cluster
///
/// # Returns
/// * `Result<BootstrapInfo, InitError>` - Member and cluster ids that were written
pub async fn write_bootstrap(
    staging: &Path,
    image: &StateImage,
    options: &RestoreOptions,
) -> Result<BootstrapInfo, InitError> {
    let info = BootstrapInfo::new(options, image.revision);
    let layout = DataLayout::new(staging);

    for dir in [layout.snap_dir(), layout.wal_dir()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(InitError::bootstrap(&dir))?;
    }

    let state = encode_state_file(image).map_err(encode_error(layout.db_path()))?;
    write_synced(&layout.db_path(), &state).await?;

    let records = [
        WalRecord::Metadata {
            member_id: info.member_id,
            cluster_id: info.cluster_id,
        },
        WalRecord::Bootstrap {
            name: options.name.clone(),
            initial_cluster: info.initial_cluster.clone(),
            cluster_token: options.cluster_token.clone(),
            peer_urls: options.peer_urls.clone(),
        },
        WalRecord::Snapshot {
            revision: image.revision,
        },
    ];
    let wal_path = layout.wal_segment_path(0, 0);
    let wal = encode_wal(&records).map_err(encode_error(&wal_path))?;
    write_synced(&wal_path, &wal).await?;

    let identity = MemberIdentity {
        version: LAYOUT_VERSION,
        name: options.name.clone(),
        member_id: info.member_id,
        cluster_id: info.cluster_id,
    };
    let identity_bytes =
        serde_json::to_vec_pretty(&identity).map_err(encode_error(layout.identity_path()))?;
    write_synced(&layout.identity_path(), &identity_bytes).await?;

    debug!(
        "Wrote bootstrap layout in {:?} (member {:016x}, cluster {:016x})",
        staging, info.member_id, info.cluster_id
    );
    Ok(info)
}

fn encode_error(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> InitError {
    let wrap = InitError::bootstrap(path);
    move |e| wrap(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), InitError> {
    let write = async {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    };
    write.await.map_err(InitError::bootstrap(path))
}

/// Sibling path of `data_dir` with `suffix` appended to its file name.
pub(crate) fn sibling(data_dir: &Path, suffix: &str) -> PathBuf {
    let mut name = data_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "data".into());
    name.push(suffix);
    data_dir.with_file_name(name)
}

/// Replaces `data_dir` with the fully written `staging` directory.
///
/// Any previous directory is first moved aside to `<data_dir>.old` and only
/// removed once `staging` sits at `data_dir`.
pub async fn install(staging: &Path, data_dir: &Path) -> Result<(), InitError> {
    let old = sibling(data_dir, ".old");
    remove_dir_if_exists(&old)
        .await
        .map_err(InitError::bootstrap(&old))?;

    let had_previous = tokio::fs::try_exists(data_dir)
        .await
        .map_err(InitError::bootstrap(data_dir))?;
    if had_previous {
        tokio::fs::rename(data_dir, &old)
            .await
            .map_err(InitError::bootstrap(data_dir))?;
    } else if let Some(parent) = data_dir.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(InitError::bootstrap(parent))?;
    }

    if let Err(e) = tokio::fs::rename(staging, data_dir).await {
        if had_previous {
            // Put the previous directory back so nothing is lost.
            if let Err(restore_err) = tokio::fs::rename(&old, data_dir).await {
                warn!(
                    "Failed to move {:?} back to {:?}: {}",
                    old, data_dir, restore_err
                );
            }
        }
        return Err(InitError::bootstrap(data_dir)(e));
    }

    if had_previous {
        if let Err(e) = remove_dir_if_exists(&old).await {
            warn!("Failed to remove previous data directory {:?}: {}", old, e);
        }
    }
    info!("✅ Installed restored data directory at {:?}", data_dir);
    Ok(())
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
