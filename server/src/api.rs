//! HTTP admin API (spec.md section 4.6): `/bt`, `/bt/status/`,
//! `/bt/config/`, `/bt/reload/`, `/bt/reloadall/`.
//!
//! Grounded on `original_source/proxy/server.go` (`versionResponse`,
//! route registration) and `original_source/proxy/api.go`
//! (`getStatus` serving the Tracker snapshot), restructured around
//! `macwilam-linksense/server/src/api.rs`'s `AppState`/`create_router`/
//! `ApiError` shape (shared `Clone` state, a dedicated error enum with
//! an `IntoResponse` impl).

use crate::config::LiveConfig;
use crate::scheduler::{try_signal_reload, ReloadSender, Scheduler};
use crate::tracker::Tracker;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::api::{endpoints, InfoResponse, ReloadResponse};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<Tracker>,
    pub scheduler: Arc<dyn Scheduler>,
    pub live_config: Arc<LiveConfig>,
    pub reload_tx: ReloadSender,
    pub nginx_config_path: PathBuf,
    pub peer_client: reqwest::Client,
    pub scheme: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(endpoints::INFO, get(get_info))
        .route(endpoints::STATUS, get(get_status))
        .route(endpoints::CONFIG, get(get_config))
        .route(endpoints::RELOAD, post(post_reload))
        .route(endpoints::RELOAD_ALL, post(post_reload_all))
        .with_state(state)
}

async fn get_info() -> Json<InfoResponse> {
    Json(InfoResponse::default())
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.tracker.snapshot().await)
}

/// Raw current NGINX config file body (spec.md section 4.6), not the
/// controller's own configuration.
async fn get_config(State(state): State<AppState>) -> Result<String, ApiError> {
    tokio::fs::read_to_string(&state.nginx_config_path)
        .await
        .map_err(|e| ApiError::Internal(format!("reading {}: {}", state.nginx_config_path.display(), e)))
}

/// Hot-reloads the `data`/`filter_regex` subset from disk, then
/// injects one reload signal into the Generator's queue — it does not
/// run a render cycle synchronously.
async fn post_reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    state
        .live_config
        .reload()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    try_signal_reload(&state.reload_tx);
    Ok(Json(ReloadResponse::accepted()))
}

/// Fans out `POST /bt/reload/` to every peer discovered via the
/// scheduler. Peer failures are logged, not aggregated; discovery
/// failure or an empty peer list is a no-op (spec.md section 4.6).
/// The local instance is not special-cased and is not reloaded by
/// this call itself.
async fn post_reload_all(State(state): State<AppState>) -> Json<ReloadResponse> {
    let peers = match state.scheduler.fetch_peer_instances().await {
        Ok(peers) => peers,
        Err(e) => {
            tracing::warn!(error = %e, "peer discovery failed, reloadall is a no-op");
            Vec::new()
        }
    };

    for peer in peers {
        let url = format!("{}://{}:{}{}", state.scheme, peer.host, peer.port, endpoints::RELOAD);
        if let Err(e) = state.peer_client.post(&url).send().await {
            tracing::warn!(
                error = %shared::Error::PeerFanout { peer: url.clone(), source: e.to_string() },
                "peer reload request failed"
            );
        }
    }

    Json(ReloadResponse::accepted())
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "error": "Internal Server Error",
            "details": self.to_string(),
        }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ReloadReceiver;
    use async_trait::async_trait;
    use shared::{App, PeerInstance};
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct StubScheduler {
        peers: Vec<PeerInstance>,
    }

    #[async_trait]
    impl Scheduler for StubScheduler {
        async fn watch(&self, _reload_tx: ReloadSender) {}
        async fn shutdown(&self) {}
        async fn fetch_apps(&self) -> shared::Result<HashMap<String, App>> {
            Ok(HashMap::new())
        }
        async fn fetch_peer_instances(&self) -> shared::Result<Vec<PeerInstance>> {
            Ok(self.peers.clone())
        }
    }

    fn build_state(dir: &tempfile::TempDir) -> (AppState, ReloadReceiver) {
        let config_path = dir.path().join("beethoven.toml");
        std::fs::write(
            &config_path,
            "scheduler_type = 1\n[marathon]\nendpoints = [\"http://localhost:8080\"]\n",
        )
        .unwrap();
        let base_config = shared::Config::load_from_file(&config_path).unwrap();
        let live_config = Arc::new(LiveConfig::new(config_path, &base_config).unwrap());
        let (reload_tx, reload_rx) = mpsc::channel(crate::scheduler::RELOAD_QUEUE_CAPACITY);

        let state = AppState {
            tracker: Arc::new(Tracker::new()),
            scheduler: Arc::new(StubScheduler { peers: Vec::new() }),
            live_config,
            reload_tx,
            nginx_config_path: dir.path().join("nginx.conf"),
            peer_client: reqwest::Client::new(),
            scheme: "http".to_string(),
        };
        (state, reload_rx)
    }

    #[tokio::test]
    async fn info_returns_fixed_identity() {
        let Json(info) = get_info().await;
        assert_eq!(info.name, "beethoven");
    }

    #[tokio::test]
    async fn status_reflects_tracker_snapshot() {
        let dir = tempdir().unwrap();
        let (state, _rx) = build_state(&dir);
        state.tracker.set_error(Some("boom".to_string())).await;
        let response = get_status(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn config_endpoint_returns_nginx_file_body() {
        let dir = tempdir().unwrap();
        let (state, _rx) = build_state(&dir);
        std::fs::write(&state.nginx_config_path, "events {}\n").unwrap();
        let body = get_config(State(state)).await.unwrap();
        assert_eq!(body, "events {}\n");
    }

    #[tokio::test]
    async fn config_endpoint_missing_file_is_internal_error() {
        let dir = tempdir().unwrap();
        let (state, _rx) = build_state(&dir);
        assert!(get_config(State(state)).await.is_err());
    }

    #[tokio::test]
    async fn reload_injects_signal_after_hot_reload() {
        let dir = tempdir().unwrap();
        let (state, mut rx) = build_state(&dir);
        post_reload(State(state)).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn reload_all_is_noop_with_no_peers() {
        let dir = tempdir().unwrap();
        let (state, _rx) = build_state(&dir);
        let Json(response) = post_reload_all(State(state)).await;
        assert_eq!(response.status, "reload signal queued");
    }
}
