//! The capture and restore service: consumes system events, records
//! snapshots, restores on request and publishes what happened.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapters::AdapterRegistry;
use crate::config::Config;
use crate::error::RewindError;
use crate::events::{ServiceEvent, SystemEvent};
use crate::restore::{RestoreOutcome, RestoreReconciler};
use crate::state::{stable_app_id, ObservedAppState};
use crate::timeline::{AppSummary, SnapshotMeta, TimelineStore, TrackingState};

const SERVICE_EVENT_CAPACITY: usize = 256;
const USER_REASON: &str = "user";

/// Source of application observations.
pub trait Observer: Send + Sync {
    /// Observes the application `event` concerns, usually the foreground one.
    /// `None` when there is nothing to observe (desktop, lock screen).
    fn capture(&self, event: &SystemEvent) -> anyhow::Result<Option<ObservedAppState>>;
}

#[derive(Debug, Default)]
struct Tracking {
    paused: bool,
    paused_apps: HashSet<String>,
}

pub struct Rewinder {
    config: Config,
    store: Arc<TimelineStore>,
    adapters: AdapterRegistry,
    observer: Arc<dyn Observer>,
    reconciler: RestoreReconciler,
    tracking: RwLock<Tracking>,
    events: broadcast::Sender<ServiceEvent>,
    cancel: CancellationToken,
}

impl Rewinder {
    pub fn new(config: Config, observer: Arc<dyn Observer>, reconciler: RestoreReconciler) -> crate::Result<Self> {
        config.validate()?;
        let store = Arc::new(TimelineStore::new(&config));
        let (events, _) = broadcast::channel(SERVICE_EVENT_CAPACITY);
        Ok(Self {
            config,
            store,
            adapters: AdapterRegistry::new(),
            observer,
            reconciler,
            tracking: RwLock::new(Tracking::default()),
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<TimelineStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn publish(&self, event: ServiceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Drains `events` until the channel closes or the service shuts down.
    /// Events are handled one at a time, in arrival order.
    pub async fn run_capture_loop(&self, mut events: mpsc::Receiver<SystemEvent>) {
        info!("Capture loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Capture loop shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle_event(&event);
                    }
                    None => {
                        info!("Event source closed, capture loop stopping");
                        break;
                    }
                },
            }
        }
    }

    /// Observes and records after a single system event. Failures are logged.
    pub fn handle_event(&self, event: &SystemEvent) -> Option<SnapshotMeta> {
        if !event.kind.triggers_capture() {
            return None;
        }
        if self.with_tracking(|t| t.paused).unwrap_or(false) {
            return None;
        }

        let state = match self.observer.capture(event) {
            Ok(Some(state)) => state,
            Ok(None) => return None,
            Err(e) => {
                debug!("Observation after {:?} failed: {:#}", event.kind, e);
                return None;
            }
        };

        match self.record(state) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Failed to record observation: {}", e);
                None
            }
        }
    }

    /// Runs adapters and exclusion rules over `state`, then ingests it. The
    /// application id is recomputed from the executable path first.
    #[instrument(skip(self, state), fields(exe = %state.executable_path))]
    pub fn record(&self, mut state: ObservedAppState) -> crate::Result<Option<SnapshotMeta>> {
        state.app_id = stable_app_id(&state.executable_path);
        if !self.is_tracking(&state.app_id) {
            debug!("Tracking paused, skipping");
            return Ok(None);
        }
        if !self.config.rules.allow(&state.executable_path, &state.foreground_window_class) {
            debug!("Excluded by rules, skipping");
            return Ok(None);
        }

        self.adapters.capture(&mut state);
        let meta = self.store.ingest(&state)?;
        if let Some(meta) = &meta {
            self.publish(ServiceEvent::SnapshotCreated { snapshot: meta.clone() });
        }
        Ok(meta)
    }

    /// Every tracked application with its current tracking state.
    pub fn list_applications(&self) -> crate::Result<Vec<AppSummary>> {
        let mut apps = self.store.get_apps()?;
        self.with_tracking(|t| {
            for app in &mut apps {
                if t.paused || t.paused_apps.contains(&app.app_id) {
                    app.tracking_state = TrackingState::Paused;
                }
            }
        })?;
        Ok(apps)
    }

    pub fn list_snapshots(&self, app_id: &str) -> crate::Result<Vec<SnapshotMeta>> {
        self.store.get_timeline(app_id)
    }

    /// Restores `app_id` to `snapshot_id`, publishing a progress event per
    /// stage and a terminal error event on failure.
    pub async fn restore_snapshot(&self, app_id: &str, snapshot_id: &str) -> crate::Result<RestoreOutcome> {
        info!("Restoring {} to snapshot {}", app_id, snapshot_id);
        let result = self
            .reconciler
            .restore(&self.store, &self.adapters, app_id, snapshot_id, |progress| {
                self.publish(ServiceEvent::RestoreProgress(progress))
            })
            .await;

        if let Err(e) = &result {
            if e.is_not_found() {
                debug!("Restore target not found: {}", e);
            } else {
                warn!("Restore of {} failed: {}", app_id, e);
            }
            self.publish(ServiceEvent::RestoreError {
                app_id: app_id.to_string(),
                snapshot_id: snapshot_id.to_string(),
                kind: e.kind(),
                message: e.to_string(),
            });
        }
        result
    }

    /// Pauses tracking for one application, or globally with `None`.
    pub fn pause_tracking(&self, app_id: Option<&str>) -> crate::Result<()> {
        self.set_tracking(app_id, TrackingState::Paused)
    }

    pub fn resume_tracking(&self, app_id: Option<&str>) -> crate::Result<()> {
        self.set_tracking(app_id, TrackingState::Active)
    }

    pub fn is_tracking(&self, app_id: &str) -> bool {
        self.with_tracking(|t| !t.paused && !t.paused_apps.contains(app_id))
            .unwrap_or(false)
    }

    fn set_tracking(&self, app_id: Option<&str>, state: TrackingState) -> crate::Result<()> {
        let paused = state == TrackingState::Paused;
        {
            let mut tracking = self
                .tracking
                .write()
                .map_err(|e| RewindError::Storage(e.to_string()))?;
            match app_id {
                None => tracking.paused = paused,
                Some(id) if paused => {
                    tracking.paused_apps.insert(id.to_string());
                }
                Some(id) => {
                    tracking.paused_apps.remove(id);
                }
            }
        }

        info!(
            "Tracking {} for {}",
            if paused { "paused" } else { "resumed" },
            app_id.unwrap_or("all applications")
        );
        self.publish(ServiceEvent::TrackingStateChanged {
            app_id: app_id.map(str::to_string),
            state,
            reason: USER_REASON.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    fn with_tracking<F, R>(&self, f: F) -> crate::Result<R>
    where
        F: FnOnce(&Tracking) -> R,
    {
        let guard = self.tracking.read().map_err(|e| RewindError::Storage(e.to_string()))?;
        Ok(f(&guard))
    }

    /// Stops the capture loop. In-flight restores run to completion.
    pub fn shutdown(&self) {
        info!("Shutting down");
        self.cancel.cancel();
    }
}
