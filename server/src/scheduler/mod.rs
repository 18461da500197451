//! Scheduler contract (spec.md section 4.1) and the two adapters that
//! implement it.
//!
//! Grounded on `original_source/scheduler/scheduler.go` (trait shape,
//! `shouldTriggerReload`, `appIdToDashes`) and
//! `original_source/scheduler/types.go`.

pub mod marathon;
pub mod swarm;

use async_trait::async_trait;
use shared::{App, PeerInstance};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Bounded capacity of the reload-signal channel (spec.md section 5):
/// one slot for the signal being processed, one for the next pending
/// signal.
pub const RELOAD_QUEUE_CAPACITY: usize = 2;

pub type ReloadSender = mpsc::Sender<()>;
pub type ReloadReceiver = mpsc::Receiver<()>;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Start background work; must return immediately. Immediately
    /// enqueues one initial reload signal so the first render happens
    /// without waiting for an external event (spec.md section 4.1).
    async fn watch(&self, reload_tx: ReloadSender);

    /// Cooperative, idempotent stop of background work.
    async fn shutdown(&self);

    /// Snapshot the current topology. Apps with zero tasks are never
    /// included (spec.md invariant 2).
    async fn fetch_apps(&self) -> shared::Result<HashMap<String, App>>;

    /// Enumerate sibling controller instances for cluster-wide reload.
    async fn fetch_peer_instances(&self) -> shared::Result<Vec<PeerInstance>>;
}

/// Shared decision of whether an upstream event should enqueue a
/// reload signal: the identifier must be non-empty and, if a filter
/// regex is configured, must match it.
pub fn should_trigger_reload(app_id: &str, filter: Option<&regex::Regex>) -> bool {
    if app_id.is_empty() {
        tracing::warn!("event: could not locate AppId");
        return false;
    }
    match filter {
        Some(re) => {
            let matched = re.is_match(app_id);
            tracing::debug!(app_id, matched, "matching appId against filter");
            matched
        }
        None => true,
    }
}

/// Marathon app IDs use `/` as a path separator; template identifiers
/// need a flat, template-safe string. `/products/stores/someservice`
/// becomes `products-stores-someservice` (spec.md invariant 8).
pub fn app_id_to_dashes(app_id: &str) -> String {
    app_id.trim_start_matches('/').replace('/', "-")
}

/// Non-blocking enqueue of a reload signal. A full queue means a
/// cycle is already pending; the signal is dropped, which is correct
/// because one queued signal suffices to trigger one reload cycle
/// (spec.md section 4.2/4.4).
pub fn try_signal_reload(reload_tx: &ReloadSender) {
    match reload_tx.try_send(()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(())) => {
            tracing::warn!("reload queue is full, dropping signal");
        }
        Err(mpsc::error::TrySendError::Closed(())) => {
            tracing::warn!("reload queue is closed, dropping signal");
        }
    }
}
