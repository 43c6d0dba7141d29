//! Reconstruction of historical full states from a timeline's delta chain.

use serde::Serialize;
use tracing::trace;

use crate::checkpoint::CheckpointStore;
use crate::error::RewindError;
use crate::state::{FullState, ObservedAppState};
use crate::timeline::{Snapshot, Timeline};

/// A snapshot together with the full state it stands for.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedSnapshot {
    pub snapshot: Snapshot,
    pub state: FullState,
    /// Number of deltas replayed onto the seed, the target's own included.
    pub replayed: usize,
}

/// Where replay starts.
enum Seed<'a> {
    Checkpoint(&'a str),
    Empty,
}

/// Resolves the snapshot at `index` in `timeline`.
///
/// Walks parent links back to the nearest checkpoint (seeded from disk) or
/// root snapshot (seeded with the empty state), then replays the collected
/// deltas oldest first. A parent that is no longer retained fails with
/// [`RewindError::BrokenChain`]; a checkpoint that cannot be read fails with
/// [`RewindError::Storage`].
pub(crate) fn resolve_at(
    timeline: &Timeline,
    index: usize,
    checkpoints: &CheckpointStore,
) -> crate::Result<ResolvedSnapshot> {
    let snapshots = &timeline.snapshots;
    let target = snapshots
        .get(index)
        .ok_or_else(|| RewindError::SnapshotNotFound(format!("{}#{}", timeline.app_id, index)))?;

    let mut chain = vec![index];
    let mut cursor = index;
    let seed = loop {
        let snapshot = &snapshots[cursor];
        if let Some(reference) = snapshot.checkpoint_ref.as_deref() {
            break Seed::Checkpoint(reference);
        }
        let Some(parent_id) = snapshot.parent_id.as_deref() else {
            break Seed::Empty;
        };
        // Parents precede their children, almost always immediately.
        let parent = snapshots[..cursor]
            .iter()
            .rposition(|s| s.snapshot_id == parent_id)
            .ok_or_else(|| RewindError::BrokenChain {
                snapshot_id: snapshot.snapshot_id.clone(),
                parent_id: parent_id.to_string(),
            })?;
        chain.push(parent);
        cursor = parent;
    };

    let mut state = match seed {
        Seed::Checkpoint(reference) => checkpoints.load(reference)?,
        Seed::Empty => ObservedAppState::seed(&timeline.app_id, &timeline.executable_path),
    };

    for &i in chain.iter().rev() {
        trace!("Replaying delta of {}", snapshots[i].snapshot_id);
        snapshots[i].delta.apply(&mut state);
    }
    state.timestamp = target.timestamp;

    Ok(ResolvedSnapshot {
        snapshot: target.clone(),
        state,
        replayed: chain.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::diff;
    use crate::state::{Rect, WindowDescriptor};
    use chrono::Utc;
    use tempfile::TempDir;

    const EXE: &str = "/usr/bin/viewer";

    fn state_at(left: i32) -> ObservedAppState {
        let mut s = ObservedAppState::new(EXE, 3);
        s.windows.push(WindowDescriptor::new(7, Rect::new(left, 0, left + 100, 100)));
        s
    }

    fn snapshot(id: &str, parent: Option<&str>, prev: &ObservedAppState, next: &ObservedAppState) -> Snapshot {
        Snapshot {
            snapshot_id: id.to_string(),
            app_id: next.app_id.clone(),
            parent_id: parent.map(str::to_string),
            delta: diff(prev, next),
            window_count: next.windows.len(),
            timestamp: Utc::now(),
            checkpoint_ref: None,
            approx_bytes: 0,
        }
    }

    fn chain() -> Timeline {
        let s1 = state_at(0);
        let s2 = state_at(10);
        let s3 = state_at(20);
        let empty = ObservedAppState::seed(&s1.app_id, EXE);

        let mut timeline = Timeline::new(&s1.app_id, EXE);
        timeline.snapshots = vec![
            snapshot("a", None, &empty, &s1),
            snapshot("b", Some("a"), &s1, &s2),
            snapshot("c", Some("b"), &s2, &s3),
        ];
        timeline
    }

    #[test]
    fn test_root_chain_replays_from_empty_seed() {
        let tmp_dir = TempDir::new().unwrap();
        let checkpoints = CheckpointStore::new(tmp_dir.path());
        let timeline = chain();

        let resolved = resolve_at(&timeline, 2, &checkpoints).unwrap();
        assert_eq!(resolved.replayed, 3);
        assert_eq!(resolved.snapshot.snapshot_id, "c");
        assert_eq!(resolved.state.windows.len(), 1);
        assert_eq!(resolved.state.windows[0].rect.left, 20);
        assert_eq!(resolved.state.executable_path, EXE);
        assert_eq!(resolved.state.timestamp, timeline.snapshots[2].timestamp);

        let first = resolve_at(&timeline, 0, &checkpoints).unwrap();
        assert_eq!(first.replayed, 1);
        assert_eq!(first.state.windows[0].rect.left, 0);
    }

    #[test]
    fn test_missing_parent_is_a_broken_chain() {
        let tmp_dir = TempDir::new().unwrap();
        let checkpoints = CheckpointStore::new(tmp_dir.path());
        let mut timeline = chain();
        timeline.snapshots.remove(0);

        let err = resolve_at(&timeline, 1, &checkpoints).unwrap_err();
        match err {
            RewindError::BrokenChain { snapshot_id, parent_id } => {
                assert_eq!(snapshot_id, "b");
                assert_eq!(parent_id, "a");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_seeds_replay() {
        let tmp_dir = TempDir::new().unwrap();
        let checkpoints = CheckpointStore::new(tmp_dir.path());
        let mut timeline = chain();

        let mut full = state_at(10);
        full.command_line = "viewer --restore".into();
        timeline.snapshots[1].checkpoint_ref = Some(checkpoints.spill(&full).unwrap());
        timeline.snapshots[1].parent_id = None;

        let resolved = resolve_at(&timeline, 2, &checkpoints).unwrap();
        assert_eq!(resolved.replayed, 2);
        assert_eq!(resolved.state.command_line, "viewer --restore");
        assert_eq!(resolved.state.windows[0].rect.left, 20);
    }

    #[test]
    fn test_index_out_of_range() {
        let tmp_dir = TempDir::new().unwrap();
        let checkpoints = CheckpointStore::new(tmp_dir.path());
        let err = resolve_at(&chain(), 9, &checkpoints).unwrap_err();
        assert!(err.is_not_found());
    }
}
