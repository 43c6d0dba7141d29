use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ErrorKind;
use crate::restore::RestoreProgress;
use crate::state::WindowHandle;
use crate::timeline::{SnapshotMeta, TrackingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    ForegroundChanged,
    WindowMoved,
    WindowDestroyed,
    WindowShown,
    WindowHidden,
    ProcessStarted,
    ProcessExited,
    ClipboardChanged,
}

impl SystemEventKind {
    /// Whether the event warrants observing the foreground application.
    /// A destroyed window leaves nothing to observe; the next event of its
    /// application records the removal.
    pub fn triggers_capture(&self) -> bool {
        !matches!(self, SystemEventKind::WindowDestroyed)
    }
}

/// Notification from the OS hook layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub kind: SystemEventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub handle: Option<WindowHandle>,
}

impl SystemEvent {
    pub fn new(kind: SystemEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            pid: 0,
            handle: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }
}

/// Producer side of the bounded observation channel.
///
/// Publishing never blocks the hook thread: when the consumer falls behind the
/// newest event is dropped and counted.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<SystemEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SystemEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let bus = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (bus, rx)
    }

    /// Returns false when the event was not queued.
    pub fn publish(&self, event: SystemEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("Event queue full, dropping {:?} ({} dropped so far)", event.kind, dropped);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Outward notifications of the service, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    SnapshotCreated {
        snapshot: SnapshotMeta,
    },
    RestoreProgress(RestoreProgress),
    RestoreError {
        app_id: String,
        snapshot_id: String,
        kind: ErrorKind,
        message: String,
    },
    TrackingStateChanged {
        /// `None` for the global switch.
        app_id: Option<String>,
        state: TrackingState,
        reason: String,
        at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restore::RestoreStage;

    #[test]
    fn test_destroyed_windows_do_not_trigger_capture() {
        assert!(SystemEventKind::ForegroundChanged.triggers_capture());
        assert!(SystemEventKind::ClipboardChanged.triggers_capture());
        assert!(SystemEventKind::ProcessExited.triggers_capture());
        assert!(!SystemEventKind::WindowDestroyed.triggers_capture());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (bus, mut rx) = EventBus::new(2);
        assert!(bus.publish(SystemEvent::new(SystemEventKind::ForegroundChanged).with_pid(1)));
        assert!(bus.publish(SystemEvent::new(SystemEventKind::WindowMoved).with_pid(2)));
        assert!(!bus.publish(SystemEvent::new(SystemEventKind::WindowShown).with_pid(3)));
        assert_eq!(bus.dropped(), 1);

        assert_eq!(rx.recv().await.unwrap().pid, 1);
        assert_eq!(rx.recv().await.unwrap().pid, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_queue_rejects_events() {
        let (bus, rx) = EventBus::new(4);
        drop(rx);
        assert!(!bus.publish(SystemEvent::new(SystemEventKind::ProcessStarted)));
        assert_eq!(bus.dropped(), 0);
    }

    #[test]
    fn test_service_event_wire_format() {
        let event = ServiceEvent::RestoreProgress(RestoreProgress {
            app_id: "editor.exe:00".into(),
            snapshot_id: "s1".into(),
            stage: RestoreStage::WaitWindows,
            percent: 35,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "restore_progress");
        assert_eq!(value["stage"], "wait_windows");
        assert_eq!(value["percent"], 35);

        let event = ServiceEvent::TrackingStateChanged {
            app_id: None,
            state: TrackingState::Paused,
            reason: "user".into(),
            at: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tracking_state_changed");
        assert_eq!(value["state"], "paused");
        assert!(value["app_id"].is_null());
    }
}
