//! Structural differences between two observations of the same application.
//!
//! [`diff`] is pure and [`Delta::apply`] is its inverse for windows, open
//! files and plugin data. Clipboard changes are recorded as a flag only: the
//! fingerprint is not content and cannot be replayed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::state::{normalize_path, ObservedAppState, PluginData, WindowDescriptor, WindowHandle};

/// Change of a single window between two observations.
///
/// `before == None` means the window appeared, `after == None` means it went
/// away, both present means its placement changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDiff {
    pub handle: WindowHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<WindowDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<WindowDescriptor>,
}

impl WindowDiff {
    pub fn is_added(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.after.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub windows_changed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub window_diffs: Vec<WindowDiff>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_removed: Vec<String>,
    pub clipboard_changed: bool,
    pub plugin_changed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_data: Option<PluginData>,
}

impl Delta {
    pub fn files_changed(&self) -> bool {
        !self.files_added.is_empty() || !self.files_removed.is_empty()
    }

    /// True when at least one category changed. Callers skip snapshot
    /// creation for empty deltas.
    pub fn has_changes(&self) -> bool {
        self.windows_changed || self.files_changed() || self.clipboard_changed || self.plugin_changed
    }

    /// Replays this delta onto `state`. Applying a delta to a state that
    /// already contains it is a no-op.
    pub fn apply(&self, state: &mut ObservedAppState) {
        if self.windows_changed {
            let mut by_handle: BTreeMap<WindowHandle, WindowDescriptor> =
                state.windows.drain(..).map(|w| (w.handle, w)).collect();
            for wd in &self.window_diffs {
                match &wd.after {
                    Some(after) => {
                        by_handle.insert(wd.handle, after.clone());
                    }
                    None => {
                        by_handle.remove(&wd.handle);
                    }
                }
            }
            let mut windows: Vec<WindowDescriptor> = by_handle.into_values().collect();
            windows.sort_by_key(|w| w.z_order);
            state.windows = windows;
        }

        if self.files_changed() {
            let mut by_key: BTreeMap<String, String> = state
                .open_files
                .drain(..)
                .map(|f| (normalize_path(&f), f))
                .collect();
            for f in &self.files_removed {
                by_key.remove(&normalize_path(f));
            }
            for f in &self.files_added {
                by_key.insert(normalize_path(f), f.clone());
            }
            state.open_files = by_key.into_values().collect();
        }

        if self.plugin_changed {
            state.plugin_data = self.plugin_data.clone().unwrap_or_default();
        }
    }
}

/// Computes the structural difference from `prev` to `next`.
pub fn diff(prev: &ObservedAppState, next: &ObservedAppState) -> Delta {
    let window_diffs = diff_windows(&prev.windows, &next.windows);
    let (files_added, files_removed) = diff_files(&prev.open_files, &next.open_files);

    let clipboard_changed = !prev.clipboard_hash.is_empty()
        && !next.clipboard_hash.is_empty()
        && prev.clipboard_hash != next.clipboard_hash;

    let plugin_changed = canonical_plugin_bytes(&prev.plugin_data) != canonical_plugin_bytes(&next.plugin_data);

    Delta {
        windows_changed: !window_diffs.is_empty(),
        window_diffs,
        files_added,
        files_removed,
        clipboard_changed,
        plugin_changed,
        plugin_data: plugin_changed.then(|| next.plugin_data.clone()),
    }
}

fn diff_windows(prev: &[WindowDescriptor], next: &[WindowDescriptor]) -> Vec<WindowDiff> {
    let prev_by_handle: BTreeMap<WindowHandle, &WindowDescriptor> = prev.iter().map(|w| (w.handle, w)).collect();
    let next_by_handle: BTreeMap<WindowHandle, &WindowDescriptor> = next.iter().map(|w| (w.handle, w)).collect();

    let mut diffs = Vec::new();
    for (handle, after) in &next_by_handle {
        match prev_by_handle.get(handle) {
            None => diffs.push(WindowDiff {
                handle: *handle,
                before: None,
                after: Some((*after).clone()),
            }),
            Some(before) if !before.same_placement(after) => diffs.push(WindowDiff {
                handle: *handle,
                before: Some((*before).clone()),
                after: Some((*after).clone()),
            }),
            Some(_) => {}
        }
    }
    for (handle, before) in &prev_by_handle {
        if !next_by_handle.contains_key(handle) {
            diffs.push(WindowDiff {
                handle: *handle,
                before: Some((*before).clone()),
                after: None,
            });
        }
    }
    diffs
}

fn diff_files(prev: &[String], next: &[String]) -> (Vec<String>, Vec<String>) {
    let prev_keys: BTreeSet<String> = prev.iter().map(|p| normalize_path(p)).collect();
    let next_keys: BTreeSet<String> = next.iter().map(|p| normalize_path(p)).collect();

    let mut added = Vec::new();
    let mut seen = BTreeSet::new();
    for path in next {
        let key = normalize_path(path);
        if !prev_keys.contains(&key) && seen.insert(key) {
            added.push(path.trim().to_string());
        }
    }

    let mut removed = Vec::new();
    seen.clear();
    for path in prev {
        let key = normalize_path(path);
        if !next_keys.contains(&key) && seen.insert(key) {
            removed.push(path.trim().to_string());
        }
    }
    (added, removed)
}

/// Canonical serialized form of a plugin map. Keys are ordered at every
/// nesting level because both `BTreeMap` and `serde_json::Map` sort them.
fn canonical_plugin_bytes(data: &PluginData) -> Vec<u8> {
    serde_json::to_vec(data).unwrap_or_default()
}
