use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::delta::{diff, Delta};
use crate::error::RewindError;
use crate::resolver::{resolve_at, ResolvedSnapshot};
use crate::state::{display_name, stable_app_id, ObservedAppState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub app_id: String,
    /// Absent for checkpoints and for chain roots.
    pub parent_id: Option<String>,
    pub delta: Delta,
    /// Windows in the full state this snapshot stands for.
    #[serde(default)]
    pub window_count: usize,
    pub timestamp: DateTime<Utc>,
    /// Durable reference when this snapshot is a full checkpoint.
    pub checkpoint_ref: Option<String>,
    #[serde(skip)]
    pub(crate) approx_bytes: usize,
}

impl Snapshot {
    pub fn is_checkpoint(&self) -> bool {
        self.checkpoint_ref.is_some()
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            snapshot_id: self.snapshot_id.clone(),
            app_id: self.app_id.clone(),
            timestamp: self.timestamp,
            window_count: self.window_count,
            window_diffs: self.delta.window_diffs.len(),
            files_added: self.delta.files_added.len(),
            files_removed: self.delta.files_removed.len(),
            clipboard_changed: self.delta.clipboard_changed,
            plugin_changed: self.delta.plugin_changed,
            checkpoint: self.is_checkpoint(),
        }
    }
}

/// Summary of one snapshot, as published on creation and listed per timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: String,
    pub app_id: String,
    pub timestamp: DateTime<Utc>,
    pub window_count: usize,
    pub window_diffs: usize,
    pub files_added: usize,
    pub files_removed: usize,
    pub clipboard_changed: bool,
    pub plugin_changed: bool,
    pub checkpoint: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingState {
    Active,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSummary {
    pub app_id: String,
    pub name: String,
    pub executable_path: String,
    pub last_activity: DateTime<Utc>,
    pub snapshot_count: usize,
    pub memory_bytes: usize,
    pub tracking_state: TrackingState,
}

/// History of one application.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub(crate) app_id: String,
    pub(crate) executable_path: String,
    pub(crate) name: String,
    pub(crate) last_activity: DateTime<Utc>,
    /// Chronological; parents always precede their children.
    pub(crate) snapshots: Vec<Snapshot>,
    pub(crate) approx_bytes: usize,
    /// Snapshots ever created here; drives checkpoint cadence.
    pub(crate) created: u64,
    /// Last non-empty clipboard fingerprint. Replay cannot reconstruct it.
    pub(crate) last_clipboard_hash: String,
}

impl Timeline {
    pub(crate) fn new(app_id: &str, executable_path: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            executable_path: executable_path.to_string(),
            name: display_name(executable_path),
            last_activity: Utc::now(),
            snapshots: Vec::new(),
            approx_bytes: 0,
            created: 0,
            last_clipboard_hash: String::new(),
        }
    }

    fn position(&self, snapshot_id: &str) -> Option<usize> {
        self.snapshots.iter().position(|s| s.snapshot_id == snapshot_id)
    }

    fn summary(&self) -> AppSummary {
        AppSummary {
            app_id: self.app_id.clone(),
            name: self.name.clone(),
            executable_path: self.executable_path.clone(),
            last_activity: self.last_activity,
            snapshot_count: self.snapshots.len(),
            memory_bytes: self.approx_bytes,
            tracking_state: TrackingState::Active,
        }
    }

    /// Drops snapshots older than `cutoff`, then the oldest beyond `cap`, then
    /// every snapshot whose parent did not survive. The last step evicts
    /// checkpoint groups as a whole so no retained chain is left dangling.
    /// Survivors are never modified.
    pub(crate) fn evict(&mut self, cutoff: DateTime<Utc>, cap: usize) -> usize {
        let before = self.snapshots.len();

        self.snapshots.retain(|s| s.timestamp >= cutoff);
        if self.snapshots.len() > cap {
            let excess = self.snapshots.len() - cap;
            self.snapshots.drain(..excess);
        }

        let mut kept: HashSet<String> = HashSet::with_capacity(self.snapshots.len());
        self.snapshots.retain(|s| {
            let anchored = match &s.parent_id {
                None => true,
                Some(parent) => kept.contains(parent),
            };
            if anchored {
                kept.insert(s.snapshot_id.clone());
            }
            anchored
        });

        self.approx_bytes = self.snapshots.iter().map(|s| s.approx_bytes).sum();
        before - self.snapshots.len()
    }
}

const MAX_RETENTION_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Knobs the store needs from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct StoreLimits {
    pub retention: Duration,
    pub max_snapshots_per_app: usize,
    pub checkpoint_interval: usize,
}

impl StoreLimits {
    /// Raises zero counts to one and caps retention so cutoff arithmetic
    /// cannot overflow.
    fn clamped(self) -> Self {
        let max_retention = Duration::seconds(MAX_RETENTION_SECS);
        Self {
            retention: self.retention.clamp(Duration::zero(), max_retention),
            max_snapshots_per_app: self.max_snapshots_per_app.max(1),
            checkpoint_interval: self.checkpoint_interval.max(1),
        }
    }
}

impl From<&Config> for StoreLimits {
    fn from(config: &Config) -> Self {
        let max_retention = Duration::seconds(MAX_RETENTION_SECS);
        Self {
            retention: Duration::from_std(config.retention()).unwrap_or(max_retention),
            max_snapshots_per_app: config.max_snapshots_per_app,
            checkpoint_interval: config.checkpoint_interval,
        }
        .clamped()
    }
}

/// Owner of every application timeline.
///
/// Ingest takes the write lock for diff, append and eviction. Listing and
/// resolution take the read lock; resolution keeps it while a checkpoint is
/// read from disk.
pub struct TimelineStore {
    limits: StoreLimits,
    checkpoints: CheckpointStore,
    timelines: RwLock<HashMap<String, Timeline>>,
}

impl TimelineStore {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(StoreLimits::from(config), CheckpointStore::new(&config.storage_root))
    }

    pub fn with_limits(limits: StoreLimits, checkpoints: CheckpointStore) -> Self {
        Self {
            limits: limits.clamped(),
            checkpoints,
            timelines: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    fn with_read<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&HashMap<String, Timeline>) -> R,
    {
        let guard = self.timelines.read().map_err(|e| RewindError::Storage(e.to_string()))?;
        Ok(f(&guard))
    }

    fn with_write<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&mut HashMap<String, Timeline>) -> R,
    {
        let mut guard = self.timelines.write().map_err(|e| RewindError::Storage(e.to_string()))?;
        Ok(f(&mut guard))
    }

    /// Records an observation. Returns the new snapshot's summary, or `None`
    /// when nothing changed since the latest snapshot.
    ///
    /// The timeline key is always derived from the executable path; an
    /// `app_id` supplied by the observer is overwritten.
    ///
    /// Checkpoint write failures are logged and the snapshot is kept as a
    /// plain delta; the only errors surfaced are lock failures.
    #[instrument(skip(self, state), fields(exe = %state.executable_path))]
    pub fn ingest(&self, state: &ObservedAppState) -> crate::Result<Option<SnapshotMeta>> {
        let now = Utc::now();
        let cutoff = now - self.limits.retention;
        if state.timestamp < cutoff {
            debug!("Observation at {} is outside the retention window, ignoring", state.timestamp);
            return Ok(None);
        }

        let app_id = stable_app_id(&state.executable_path);
        let observed = if state.app_id == app_id {
            Cow::Borrowed(state)
        } else {
            let mut owned = state.clone();
            owned.app_id = app_id;
            Cow::Owned(owned)
        };
        let state: &ObservedAppState = &observed;

        self.with_write(|timelines| {
            let timeline = timelines.entry(state.app_id.clone()).or_insert_with(|| {
                info!("Tracking new application {}", state.app_id);
                Timeline::new(&state.app_id, &state.executable_path)
            });
            self.ingest_into(timeline, state, cutoff)
        })
    }

    fn ingest_into(
        &self,
        timeline: &mut Timeline,
        state: &ObservedAppState,
        cutoff: DateTime<Utc>,
    ) -> Option<SnapshotMeta> {
        timeline.last_activity = state.timestamp;
        if !state.executable_path.is_empty() {
            timeline.executable_path = state.executable_path.clone();
            timeline.name = display_name(&state.executable_path);
        }

        let evicted = timeline.evict(cutoff, self.limits.max_snapshots_per_app);
        if evicted > 0 {
            debug!("Retention evicted {} snapshots", evicted);
        }

        let (mut base, parent_id) = match timeline.snapshots.len().checked_sub(1) {
            None => (ObservedAppState::seed(&timeline.app_id, &timeline.executable_path), None),
            Some(last) => match resolve_at(timeline, last, &self.checkpoints) {
                Ok(resolved) => (resolved.state, Some(resolved.snapshot.snapshot_id)),
                Err(e) => {
                    warn!("Could not resolve latest snapshot, starting a new chain: {}", e);
                    (ObservedAppState::seed(&timeline.app_id, &timeline.executable_path), None)
                }
            },
        };
        base.clipboard_hash = timeline.last_clipboard_hash.clone();

        let delta = diff(&base, state);
        if !state.clipboard_hash.is_empty() {
            timeline.last_clipboard_hash = state.clipboard_hash.clone();
        }
        if !delta.has_changes() && !timeline.snapshots.is_empty() {
            debug!("No changes detected, skipping snapshot");
            return None;
        }

        let mut snapshot = Snapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            app_id: timeline.app_id.clone(),
            parent_id,
            delta,
            window_count: state.windows.len(),
            timestamp: state.timestamp,
            checkpoint_ref: None,
            approx_bytes: 0,
        };

        // A new chain root carries no launch data unless it is a checkpoint.
        let starts_chain = snapshot.parent_id.is_none();
        if starts_chain || timeline.created % self.limits.checkpoint_interval as u64 == 0 {
            match self.checkpoints.spill(state) {
                Ok(reference) => {
                    snapshot.checkpoint_ref = Some(reference);
                    snapshot.parent_id = None;
                }
                Err(e) => warn!("Checkpoint write failed, keeping delta only: {}", e),
            }
        }
        snapshot.approx_bytes = serde_json::to_vec(&snapshot).map(|v| v.len()).unwrap_or(0);

        timeline.created += 1;
        timeline.approx_bytes += snapshot.approx_bytes;
        let meta = snapshot.meta();
        timeline.snapshots.push(snapshot);
        timeline.evict(cutoff, self.limits.max_snapshots_per_app);

        info!(
            "Snapshot {} created ({} window diffs, +{}/-{} files, checkpoint: {}, total: {})",
            meta.snapshot_id,
            meta.window_diffs,
            meta.files_added,
            meta.files_removed,
            meta.checkpoint,
            timeline.snapshots.len()
        );
        Some(meta)
    }

    /// One summary per tracked application, most recently active first.
    pub fn get_apps(&self) -> crate::Result<Vec<AppSummary>> {
        self.with_read(|timelines| {
            let mut apps: Vec<AppSummary> = timelines.values().map(Timeline::summary).collect();
            apps.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
            apps
        })
    }

    /// Snapshot summaries for `app_id`, newest first. Unknown applications
    /// yield an empty list.
    pub fn get_timeline(&self, app_id: &str) -> crate::Result<Vec<SnapshotMeta>> {
        self.with_read(|timelines| {
            let mut metas: Vec<SnapshotMeta> = timelines
                .get(app_id)
                .map(|tl| tl.snapshots.iter().map(Snapshot::meta).collect())
                .unwrap_or_default();
            metas.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            metas
        })
    }

    /// Retained snapshots of `app_id` in chronological order.
    pub fn snapshots(&self, app_id: &str) -> crate::Result<Vec<Snapshot>> {
        self.with_read(|timelines| timelines.get(app_id).map(|tl| tl.snapshots.clone()).unwrap_or_default())
    }

    #[instrument(skip(self))]
    pub fn resolve_snapshot(&self, app_id: &str, snapshot_id: &str) -> crate::Result<ResolvedSnapshot> {
        self.with_read(|timelines| {
            let timeline = timelines
                .get(app_id)
                .ok_or_else(|| RewindError::AppNotFound(app_id.to_string()))?;
            let index = timeline
                .position(snapshot_id)
                .ok_or_else(|| RewindError::SnapshotNotFound(snapshot_id.to_string()))?;
            resolve_at(timeline, index, &self.checkpoints)
        })?
    }
}
