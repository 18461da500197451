//! Process-wide pipeline status, read by the HTTP admin API and
//! written from every stage of the generator's render cycle.
//!
//! Grounded on `original_source/tracker/tracker.go` and
//! `tracker/types.go` — method names are carried over directly. Per
//! spec.md section 5 ("Tracker state is shared across HTTP and render
//! tasks; an implementation MUST serialize its mutators"), access is
//! serialized with a `tokio::sync::RwLock` rather than the teacher's
//! health-monitor-scale `Arc<Mutex<...>>`, since this state is a
//! single small struct, not a database handle.

use chrono::Utc;
use shared::{Status, ValidationError};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct Tracker {
    status: RwLock<Status>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(Status::default()),
        }
    }

    pub async fn snapshot(&self) -> Status {
        self.status.read().await.clone()
    }

    pub async fn set_error(&self, err: Option<String>) {
        self.status.write().await.last_error = err;
    }

    pub async fn clear_error(&self) {
        self.set_error(None).await;
    }

    pub async fn set_validation_error(&self, err: Option<ValidationError>) {
        self.status.write().await.validation_error = err;
    }

    pub async fn set_last_sync(&self) {
        self.status.write().await.last_updated.last_sync = Some(Utc::now());
    }

    pub async fn set_last_config_rendered(&self) {
        self.status.write().await.last_updated.last_config_rendered = Some(Utc::now());
    }

    pub async fn set_last_config_valid(&self) {
        self.status.write().await.last_updated.last_config_valid = Some(Utc::now());
    }

    pub async fn set_last_proxy_reload(&self) {
        self.status.write().await.last_updated.last_proxy_reload = Some(Utc::now());
    }

    pub async fn set_last_config_hash(&self, hash: String) {
        self.status.write().await.last_config_hash = Some(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_errors_and_clears_them() {
        let tracker = Tracker::new();
        tracker.set_error(Some("boom".to_string())).await;
        assert_eq!(tracker.snapshot().await.last_error, Some("boom".to_string()));
        tracker.clear_error().await;
        assert_eq!(tracker.snapshot().await.last_error, None);
    }

    #[tokio::test]
    async fn stamps_timestamps() {
        let tracker = Tracker::new();
        assert!(tracker.snapshot().await.last_updated.last_sync.is_none());
        tracker.set_last_sync().await;
        assert!(tracker.snapshot().await.last_updated.last_sync.is_some());
    }
}
