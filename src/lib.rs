pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod delta;
pub mod error;
pub mod events;
pub mod resolver;
pub mod restore;
pub mod service;
pub mod state;
pub mod timeline;

pub use adapters::{AdapterRegistry, RestoreAdapter};
pub use checkpoint::CheckpointStore;
pub use config::{Config, Rules};
pub use delta::{diff, Delta, WindowDiff};
pub use error::{ErrorKind, RewindError};
pub use events::{EventBus, ServiceEvent, SystemEvent, SystemEventKind};
pub use resolver::ResolvedSnapshot;
pub use restore::{
    LiveWindow, ProcessControl, RestoreOutcome, RestoreProgress, RestoreReconciler, RestoreStage, WaitPolicy,
    WindowSystem,
};
pub use service::{Observer, Rewinder};
pub use state::{FullState, ObservedAppState, Rect, ShowState, WindowDescriptor, WindowHandle};
pub use timeline::{AppSummary, Snapshot, SnapshotMeta, TimelineStore, TrackingState};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, RewindError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_creation() {
        let tmp_dir = TempDir::new().unwrap();
        let store = TimelineStore::new(&Config::with_storage_root(tmp_dir.path()));
        assert!(store.get_apps().unwrap().is_empty());
        assert_eq!(store.limits().checkpoint_interval, 30);
        assert_eq!(store.checkpoints().root(), tmp_dir.path());
    }

    #[test]
    fn test_snapshot_recording() {
        let tmp_dir = TempDir::new().unwrap();
        let store = TimelineStore::new(&Config::with_storage_root(tmp_dir.path()));
        let mut state = ObservedAppState::new("/usr/bin/editor", 1);
        state.open_files.push("/home/me/todo.txt".into());

        let meta = store.ingest(&state).unwrap().unwrap();
        assert_eq!(meta.files_added, 1);
        let timeline = store.get_timeline(&state.app_id).unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].snapshot_id, meta.snapshot_id);
    }

    #[test]
    fn test_resolution_roundtrip() {
        let tmp_dir = TempDir::new().unwrap();
        let store = TimelineStore::new(&Config::with_storage_root(tmp_dir.path()));
        let mut state = ObservedAppState::new("/usr/bin/editor", 1);
        state.windows.push(WindowDescriptor::new(5, Rect::new(0, 0, 10, 10)));
        let meta = store.ingest(&state).unwrap().unwrap();

        let resolved = store.resolve_snapshot(&state.app_id, &meta.snapshot_id).unwrap();
        assert_eq!(resolved.state.windows, state.windows);
        assert_eq!(resolved.state.pid, 1);
    }
}
