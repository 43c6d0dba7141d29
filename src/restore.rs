//! Brings an application back to a resolved snapshot: relaunch if needed,
//! remap saved windows onto live ones, reapply placement and focus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::adapters::AdapterRegistry;
use crate::error::RewindError;
use crate::state::{FullState, Rect, ShowState, WindowDescriptor, WindowHandle};
use crate::timeline::TimelineStore;

/// Process lifecycle operations of the host OS.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Starts the application and returns its PID.
    fn launch(&self, executable_path: &str, command_line: &str, working_dir: &str) -> crate::Result<u32>;
}

/// A top-level window as currently enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveWindow {
    pub handle: WindowHandle,
    pub class_name: String,
    pub title: String,
}

/// Window manager operations. Placement calls are best effort: failures are
/// the implementation's to log, the reconciler carries on.
pub trait WindowSystem: Send + Sync {
    /// Visible top-level windows owned by `pid`, in enumeration order.
    fn windows_of(&self, pid: u32) -> Vec<LiveWindow>;

    fn is_window_of(&self, handle: WindowHandle, pid: u32) -> bool;

    fn apply_placement(&self, handle: WindowHandle, show: ShowState, rect: Rect);

    fn bring_to_top(&self, handle: WindowHandle);

    fn set_foreground(&self, handle: WindowHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStage {
    Resolve,
    EnsureProcess,
    WaitWindows,
    RestoreWindows,
    RestoreFocus,
    Done,
}

impl RestoreStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStage::Resolve => "resolve",
            RestoreStage::EnsureProcess => "ensure_process",
            RestoreStage::WaitWindows => "wait_windows",
            RestoreStage::RestoreWindows => "restore_windows",
            RestoreStage::RestoreFocus => "restore_focus",
            RestoreStage::Done => "done",
        }
    }

    /// Advisory completion percentage reported when the stage starts.
    pub fn percent(&self) -> u8 {
        match self {
            RestoreStage::Resolve => 5,
            RestoreStage::EnsureProcess => 15,
            RestoreStage::WaitWindows => 35,
            RestoreStage::RestoreWindows => 60,
            RestoreStage::RestoreFocus => 90,
            RestoreStage::Done => 100,
        }
    }
}

impl std::fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreProgress {
    pub app_id: String,
    pub snapshot_id: String,
    pub stage: RestoreStage,
    pub percent: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub app_id: String,
    pub snapshot_id: String,
    pub pid: u32,
    pub relaunched: bool,
    pub windows_saved: usize,
    pub windows_matched: usize,
    pub focused: Option<WindowHandle>,
}

/// Bounded readiness poll after a relaunch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

pub struct RestoreReconciler {
    process: Arc<dyn ProcessControl>,
    windows: Arc<dyn WindowSystem>,
    wait: WaitPolicy,
}

impl RestoreReconciler {
    pub fn new(process: Arc<dyn ProcessControl>, windows: Arc<dyn WindowSystem>) -> Self {
        Self {
            process,
            windows,
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Runs every restore stage for `snapshot_id`, reporting each one before
    /// it starts. The first failure aborts; nothing is rolled back.
    #[instrument(skip(self, store, adapters, on_progress))]
    pub async fn restore<F>(
        &self,
        store: &TimelineStore,
        adapters: &AdapterRegistry,
        app_id: &str,
        snapshot_id: &str,
        mut on_progress: F,
    ) -> crate::Result<RestoreOutcome>
    where
        F: FnMut(RestoreProgress),
    {
        let mut report = |stage: RestoreStage| {
            debug!("Restore stage {} ({}%)", stage, stage.percent());
            on_progress(RestoreProgress {
                app_id: app_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                stage,
                percent: stage.percent(),
            });
        };

        report(RestoreStage::Resolve);
        let mut state = store.resolve_snapshot(app_id, snapshot_id)?.state;
        adapters.restore(&mut state);

        report(RestoreStage::EnsureProcess);
        let (pid, relaunched) = self.ensure_process(&state)?;

        if relaunched {
            report(RestoreStage::WaitWindows);
            if !self.wait_for_windows(pid).await {
                warn!("No window appeared for pid {} within {:?}", pid, self.wait.timeout);
            }
        }

        report(RestoreStage::RestoreWindows);
        let matches = self.restore_windows(&state.windows, pid, relaunched);

        report(RestoreStage::RestoreFocus);
        let focused = self.restore_focus(&state, &matches, pid);

        report(RestoreStage::Done);
        info!(
            "Restored {} to snapshot {} ({}/{} windows matched, relaunched: {})",
            app_id,
            snapshot_id,
            matches.len(),
            state.windows.len(),
            relaunched
        );

        Ok(RestoreOutcome {
            app_id: app_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            pid,
            relaunched,
            windows_saved: state.windows.len(),
            windows_matched: matches.len(),
            focused,
        })
    }

    fn ensure_process(&self, state: &FullState) -> crate::Result<(u32, bool)> {
        if state.pid != 0 && self.process.is_alive(state.pid) {
            debug!("Process {} is still running", state.pid);
            return Ok((state.pid, false));
        }

        if state.executable_path.trim().is_empty() && state.command_line.trim().is_empty() {
            return Err(RewindError::Launch(format!("missing launch target for {}", state.app_id)));
        }

        let pid = self
            .process
            .launch(&state.executable_path, &state.command_line, &state.working_dir)
            .map_err(|e| match e {
                RewindError::Launch(_) => e,
                other => RewindError::Launch(other.to_string()),
            })?;
        info!("Relaunched {} as pid {}", state.display_name(), pid);
        Ok((pid, true))
    }

    /// Polls until `pid` owns at least one window. Returns false on timeout.
    pub async fn wait_for_windows(&self, pid: u32) -> bool {
        let deadline = Instant::now() + self.wait.timeout;
        loop {
            if !self.windows.windows_of(pid).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.wait.interval).await;
        }
    }

    /// Matches each saved window to a live one and reapplies its placement.
    /// Returns `(saved index, live handle)` pairs in saved order.
    ///
    /// Still-valid exact handles are claimed first so a stale descriptor
    /// earlier in the list cannot take them through a fallback.
    fn restore_windows(&self, saved: &[WindowDescriptor], pid: u32, relaunched: bool) -> Vec<(usize, WindowHandle)> {
        let live = self.windows.windows_of(pid);
        let mut claimed: HashSet<WindowHandle> = HashSet::new();
        let mut assigned: Vec<Option<WindowHandle>> = vec![None; saved.len()];

        // Handles from a previous process lifetime mean nothing after a relaunch.
        if !relaunched {
            for (index, descriptor) in saved.iter().enumerate() {
                if !claimed.contains(&descriptor.handle) && self.windows.is_window_of(descriptor.handle, pid) {
                    claimed.insert(descriptor.handle);
                    assigned[index] = Some(descriptor.handle);
                }
            }
        }

        for (index, descriptor) in saved.iter().enumerate() {
            if assigned[index].is_some() {
                continue;
            }
            match similar_window(descriptor, &live, &claimed) {
                Some(handle) => {
                    claimed.insert(handle);
                    assigned[index] = Some(handle);
                }
                None => debug!("No live window left for saved window {}", descriptor.handle),
            }
        }

        let matches: Vec<(usize, WindowHandle)> = assigned
            .into_iter()
            .enumerate()
            .filter_map(|(index, handle)| handle.map(|h| (index, h)))
            .collect();

        for &(index, handle) in &matches {
            let descriptor = &saved[index];
            self.windows.apply_placement(handle, descriptor.show_state(), descriptor.rect);
        }

        let mut raise_order = matches.clone();
        raise_order.sort_by_key(|&(index, _)| saved[index].z_order);
        for (_, handle) in raise_order {
            self.windows.bring_to_top(handle);
        }

        matches
    }

    fn restore_focus(&self, state: &FullState, matches: &[(usize, WindowHandle)], pid: u32) -> Option<WindowHandle> {
        let saved_foreground = state
            .windows
            .iter()
            .position(|w| w.is_foreground)
            .and_then(|fg| matches.iter().find(|&&(index, _)| index == fg))
            .map(|&(_, handle)| handle)
            .filter(|&handle| self.windows.is_window_of(handle, pid));

        let target = saved_foreground.or_else(|| self.windows.windows_of(pid).first().map(|w| w.handle))?;
        self.windows.set_foreground(target);
        Some(target)
    }
}

/// First unclaimed live window with the same class and title, else the same
/// class, else any unclaimed window.
fn similar_window(
    descriptor: &WindowDescriptor,
    live: &[LiveWindow],
    claimed: &HashSet<WindowHandle>,
) -> Option<WindowHandle> {
    let unclaimed = move || live.iter().filter(move |w| !claimed.contains(&w.handle));
    unclaimed()
        .find(|w| w.class_name == descriptor.class_name && w.title == descriptor.title)
        .or_else(|| unclaimed().find(|w| w.class_name == descriptor.class_name))
        .or_else(|| unclaimed().next())
        .map(|w| w.handle)
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every call and serves a scripted set of processes and windows.
    #[derive(Default)]
    pub struct FakeDesktop {
        pub alive: Mutex<HashSet<u32>>,
        pub windows: Mutex<HashMap<u32, Vec<LiveWindow>>>,
        /// Windows that appear for a pid once it has been launched.
        pub on_launch: Mutex<Vec<LiveWindow>>,
        pub next_pid: Mutex<u32>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeDesktop {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next_pid: Mutex::new(9000),
                ..Self::default()
            })
        }

        pub fn with_process(&self, pid: u32, windows: Vec<LiveWindow>) {
            self.alive.lock().unwrap().insert(pid);
            self.windows.lock().unwrap().insert(pid, windows);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    pub fn live(handle: u64, class_name: &str, title: &str) -> LiveWindow {
        LiveWindow {
            handle: WindowHandle(handle),
            class_name: class_name.to_string(),
            title: title.to_string(),
        }
    }

    impl ProcessControl for FakeDesktop {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn launch(&self, executable_path: &str, command_line: &str, _working_dir: &str) -> crate::Result<u32> {
            self.record(format!("launch {} {}", executable_path, command_line));
            if executable_path.ends_with("missing.exe") {
                return Err(RewindError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "file not found",
                )));
            }
            let mut next = self.next_pid.lock().unwrap();
            let pid = *next;
            *next += 1;
            self.alive.lock().unwrap().insert(pid);
            let windows = self.on_launch.lock().unwrap().clone();
            self.windows.lock().unwrap().insert(pid, windows);
            Ok(pid)
        }
    }

    impl WindowSystem for FakeDesktop {
        fn windows_of(&self, pid: u32) -> Vec<LiveWindow> {
            self.windows.lock().unwrap().get(&pid).cloned().unwrap_or_default()
        }

        fn is_window_of(&self, handle: WindowHandle, pid: u32) -> bool {
            self.windows_of(pid).iter().any(|w| w.handle == handle)
        }

        fn apply_placement(&self, handle: WindowHandle, show: ShowState, rect: Rect) {
            self.record(format!("place {} {:?} {},{}", handle, show, rect.left, rect.top));
        }

        fn bring_to_top(&self, handle: WindowHandle) {
            self.record(format!("raise {}", handle));
        }

        fn set_foreground(&self, handle: WindowHandle) {
            self.record(format!("focus {}", handle));
        }
    }
}
