//! Resolution of the restore plan from a snapshot listing.

use crate::error::InitError;
use crate::snapstore::SnapshotStore;
use crate::types::{SnapshotChain, SnapshotKind, SnapshotMetadata};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Lists the store and builds the restore plan up to `up_to` (or the latest revision).
pub async fn resolve_chain(
    store: &dyn SnapshotStore,
    up_to: Option<u64>,
    strict: bool,
) -> Result<SnapshotChain, InitError> {
    let listing = store.list().await?;
    info!("Snapshot store lists {} snapshot(s)", listing.len());
    plan_chain(listing, up_to, strict)
}

/// Builds the restore plan from a listing.
///
/// The result only depends on the set of snapshots, never on listing order:
/// duplicates of a revision range collapse to the latest upload, the baseline
/// is the newest full snapshot at or below `up_to`, and the deltas are the
/// contiguous run from the baseline that gets closest to the target without
/// passing it. A target above every stored revision is lowered to the newest
/// stored revision.
pub fn plan_chain(
    listing: Vec<SnapshotMetadata>,
    up_to: Option<u64>,
    strict: bool,
) -> Result<SnapshotChain, InitError> {
    let snapshots = dedup_ranges(listing);

    let latest_available = snapshots.iter().map(|s| s.end_revision).max();
    let base = snapshots
        .iter()
        .filter(|s| s.kind == SnapshotKind::Full)
        .filter(|s| up_to.map_or(true, |limit| s.end_revision <= limit))
        .max_by(|a, b| {
            a.end_revision
                .cmp(&b.end_revision)
                .then_with(|| a.created_on.cmp(&b.created_on))
                .then_with(|| a.name.cmp(&b.name))
        })
        .cloned()
        .ok_or(InitError::NoSnapshotsFound)?;

    let target = match (up_to, latest_available) {
        (Some(limit), Some(latest)) if limit > latest => {
            // Nothing newer exists yet, so this is not a gap in the chain.
            warn!(
                "⚠️  Revision {} was requested but the snapshot store only reaches revision {}; restoring up to {}",
                limit, latest, latest
            );
            latest
        }
        (Some(limit), _) => limit,
        (None, latest) => latest.unwrap_or(base.end_revision),
    };

    let deltas = farthest_path(&snapshots, base.end_revision, target);
    let running = deltas
        .last()
        .map_or(base.end_revision, |delta| delta.end_revision);
    let mut chain = vec![base];
    chain.extend(deltas.into_iter().cloned());

    let chain = SnapshotChain {
        snapshots: chain,
        target_revision: target,
    };

    if chain.is_truncated() {
        let last = chain.snapshots.last().map(|s| s.to_string()).unwrap_or_default();
        let next = snapshots
            .iter()
            .filter(|s| s.kind == SnapshotKind::Delta && s.start_revision >= running)
            .min_by(|a, b| sort_key(a, b))
            .map(|s| s.to_string());
        if strict {
            return Err(InitError::ChainGap {
                last,
                reached: running,
                target,
                next,
            });
        }
        warn!(
            "⚠️  Snapshot chain is incomplete: restoring up to revision {} after {} but revision {} was requested ({} revisions short{}). Writes after revision {} will be lost.",
            running,
            last,
            target,
            target - running,
            next.map(|n| format!(", next available snapshot is {}", n))
                .unwrap_or_default(),
            running
        );
    } else {
        info!(
            "Resolved snapshot chain of {} snapshot(s) up to revision {}",
            chain.len(),
            chain.restored_revision()
        );
    }

    Ok(chain)
}

/// Finds the run of contiguous deltas starting at `from` that reaches the highest
/// revision not above `target`, preferring fewer deltas for the same reach.
fn farthest_path(
    snapshots: &[SnapshotMetadata],
    from: u64,
    target: u64,
) -> Vec<&SnapshotMetadata> {
    let mut paths: BTreeMap<u64, Vec<&SnapshotMetadata>> = BTreeMap::new();
    paths.insert(from, Vec::new());

    // Deltas are sorted by start revision, so every path ending at a delta's
    // start is final before that delta is looked at.
    for delta in snapshots.iter().filter(|s| s.kind == SnapshotKind::Delta) {
        if delta.end_revision <= delta.start_revision || delta.end_revision > target {
            // Deltas cannot be applied partially.
            continue;
        }
        let Some(path) = paths.get(&delta.start_revision) else {
            continue;
        };
        let mut extended = path.clone();
        extended.push(delta);
        let shorter = paths
            .get(&delta.end_revision)
            .map_or(true, |existing| extended.len() < existing.len());
        if shorter {
            paths.insert(delta.end_revision, extended);
        }
    }

    paths.into_iter().next_back().map(|(_, path)| path).unwrap_or_default()
}

/// Ordering used for the plan: full before delta, then by revision range and name.
fn sort_key(a: &SnapshotMetadata, b: &SnapshotMetadata) -> Ordering {
    a.kind
        .cmp(&b.kind)
        .then_with(|| a.start_revision.cmp(&b.start_revision))
        .then_with(|| a.end_revision.cmp(&b.end_revision))
        .then_with(|| a.name.cmp(&b.name))
}

/// Keeps one snapshot per `(kind, start, end)`, preferring the latest upload.
fn dedup_ranges(listing: Vec<SnapshotMetadata>) -> Vec<SnapshotMetadata> {
    let mut by_range: BTreeMap<(SnapshotKind, u64, u64), SnapshotMetadata> = BTreeMap::new();
    for snapshot in listing {
        let key = (snapshot.kind, snapshot.start_revision, snapshot.end_revision);
        let newer = by_range.get(&key).map_or(true, |existing| {
            (existing.created_on, &existing.name) < (snapshot.created_on, &snapshot.name)
        });
        if newer {
            by_range.insert(key, snapshot);
        }
    }
    let mut snapshots: Vec<_> = by_range.into_values().collect();
    snapshots.sort_by(sort_key);
    snapshots
}
