//! Application-specific capture and restore hooks.
//!
//! Adapters enrich observations with `plugin_data` and may rewrite launch
//! parameters before a restore. They are a best-effort side channel: a failing
//! adapter is logged and skipped, never surfaced to the caller.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::state::ObservedAppState;

pub trait RestoreAdapter: Send + Sync {
    /// Key under which the adapter stores its annotations.
    fn id(&self) -> &str;

    fn can_handle(&self, state: &ObservedAppState) -> bool;

    fn capture(&self, state: &mut ObservedAppState) -> anyhow::Result<()>;

    fn restore(&self, state: &mut ObservedAppState) -> anyhow::Result<()>;
}

/// Ordered set of adapters. Several may apply to the same state; they run in
/// registration order.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn RestoreAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn RestoreAdapter>) {
        debug!("Registered restore adapter {}", adapter.id());
        self.adapters.push(adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.id().to_string()).collect()
    }

    /// Runs every applicable adapter's capture hook. Returns how many succeeded.
    pub fn capture(&self, state: &mut ObservedAppState) -> usize {
        let mut applied = 0;
        for adapter in &self.adapters {
            if !adapter.can_handle(state) {
                continue;
            }
            match adapter.capture(state) {
                Ok(()) => applied += 1,
                Err(e) => warn!("Adapter {} capture failed for {}: {:#}", adapter.id(), state.app_id, e),
            }
        }
        applied
    }

    /// Runs every applicable adapter's restore hook. Returns how many succeeded.
    pub fn restore(&self, state: &mut ObservedAppState) -> usize {
        let mut applied = 0;
        for adapter in &self.adapters {
            if !adapter.can_handle(state) {
                continue;
            }
            match adapter.restore(state) {
                Ok(()) => applied += 1,
                Err(e) => warn!("Adapter {} restore failed for {}: {:#}", adapter.id(), state.app_id, e),
            }
        }
        applied
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry").field("adapters", &self.ids()).finish()
    }
}
