use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form per-adapter annotations. A `BTreeMap` keeps keys ordered so the
/// serialized form is canonical.
pub type PluginData = BTreeMap<String, Value>;

/// A fully reconstructed application state. Checkpoints store exactly this.
pub type FullState = ObservedAppState;

/// OS-assigned window identity.
///
/// Only meaningful inside the process lifetime that produced it: after a
/// relaunch the same number may name a different window or nothing at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

impl fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShowState {
    Normal,
    Minimized,
    Maximized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub handle: WindowHandle,
    pub rect: Rect,
    #[serde(default)]
    pub monitor_id: String,
    pub z_order: i32,
    #[serde(default)]
    pub is_foreground: bool,
    #[serde(default)]
    pub is_minimized: bool,
    #[serde(default)]
    pub is_maximized: bool,
    #[serde(default)]
    pub virtual_desktop: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub title: String,
}

impl WindowDescriptor {
    pub fn new(handle: u64, rect: Rect) -> Self {
        Self {
            handle: WindowHandle(handle),
            rect,
            monitor_id: String::new(),
            z_order: 0,
            is_foreground: false,
            is_minimized: false,
            is_maximized: false,
            virtual_desktop: String::new(),
            class_name: String::new(),
            title: String::new(),
        }
    }

    /// Compares everything that placement restore cares about. Class name and
    /// title are labels for matching, not placement, and are ignored.
    pub fn same_placement(&self, other: &WindowDescriptor) -> bool {
        self.rect == other.rect
            && self.monitor_id == other.monitor_id
            && self.z_order == other.z_order
            && self.is_foreground == other.is_foreground
            && self.is_minimized == other.is_minimized
            && self.is_maximized == other.is_maximized
            && self.virtual_desktop == other.virtual_desktop
    }

    pub fn show_state(&self) -> ShowState {
        if self.is_minimized {
            ShowState::Minimized
        } else if self.is_maximized {
            ShowState::Maximized
        } else {
            ShowState::Normal
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputState {
    #[serde(default)]
    pub input_language: String,
}

/// One observation of an application, as produced by the observation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedAppState {
    /// Always recomputed from `executable_path` on ingest; see [`stable_app_id`].
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub pid: u32,
    pub executable_path: String,
    #[serde(default)]
    pub command_line: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub foreground_window_class: String,
    #[serde(default)]
    pub windows: Vec<WindowDescriptor>,
    #[serde(default)]
    pub open_files: Vec<String>,
    #[serde(default)]
    pub clipboard_hash: String,
    #[serde(default)]
    pub input_state: InputState,
    #[serde(default)]
    pub plugin_data: PluginData,
    pub timestamp: DateTime<Utc>,
}

impl ObservedAppState {
    pub fn new(executable_path: &str, pid: u32) -> Self {
        Self {
            app_id: stable_app_id(executable_path),
            pid,
            executable_path: executable_path.to_string(),
            command_line: String::new(),
            working_dir: String::new(),
            foreground_window_class: String::new(),
            windows: Vec::new(),
            open_files: Vec::new(),
            clipboard_hash: String::new(),
            input_state: InputState::default(),
            plugin_data: PluginData::new(),
            timestamp: Utc::now(),
        }
    }

    /// The state every root snapshot is replayed onto: identity and executable
    /// only, no windows, files or annotations.
    pub fn seed(app_id: &str, executable_path: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            pid: 0,
            executable_path: executable_path.to_string(),
            command_line: String::new(),
            working_dir: String::new(),
            foreground_window_class: String::new(),
            windows: Vec::new(),
            open_files: Vec::new(),
            clipboard_hash: String::new(),
            input_state: InputState::default(),
            plugin_data: PluginData::new(),
            timestamp: DateTime::<Utc>::default(),
        }
    }

    pub fn display_name(&self) -> String {
        display_name(&self.executable_path)
    }
}

/// Stable application identity: lowercased file name plus a short hash of the
/// lowercased full path. Independent of PID and of path letter case.
pub fn stable_app_id(executable_path: &str) -> String {
    let trimmed = executable_path.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    let lowered = trimmed.to_lowercase();
    let digest = Sha256::digest(lowered.as_bytes());
    format!("{}:{}", display_name(&lowered), hex::encode(&digest[..8]))
}

/// File name of an executable path, accepting both separator styles.
pub fn display_name(executable_path: &str) -> String {
    executable_path
        .trim()
        .rsplit(['\\', '/'])
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Key used to compare open-file paths.
pub fn normalize_path(path: &str) -> String {
    path.trim().to_lowercase()
}
