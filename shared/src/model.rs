//! Canonical data model consumed by the NGINX template.
//!
//! Grounded on `original_source/scheduler/types.go`,
//! `original_source/generator/types.go` and
//! `original_source/tracker/types.go`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One endpoint of an [`App`].
///
/// Invariant: `ports.len() >= 1`. An instance failing that invariant
/// must never be constructed; schedulers filter it out upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub host: String,
    pub ports: Vec<u32>,
    pub service_ports: Vec<u32>,
    pub staged_at: String,
    pub started_at: String,
    pub version: String,
}

/// A deployed application exposed to the template.
///
/// An `App` with zero `tasks` is never emitted into [`TemplateData`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub app_id: String,
    pub tasks: Vec<Task>,
    pub labels: HashMap<String, String>,
    /// Marathon only; empty for Swarm.
    pub env: HashMap<String, String>,
}

/// Root object handed to the template engine.
///
/// Depending on the `root_apps` configuration option the template sees
/// either `apps` at its root or this whole structure at its root; the
/// generator picks which value to pass to `tera` based on that flag
/// rather than this type having two shapes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateData {
    pub apps: HashMap<String, App>,
    pub data: HashMap<String, serde_json::Value>,
}

/// A sibling controller instance reachable over HTTP, used for cluster
/// fan-out reload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInstance {
    pub host: String,
    pub port: u32,
}

/// Timestamps for each pipeline stage, carried inside [`Status`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Updates {
    pub last_sync: Option<chrono::DateTime<chrono::Utc>>,
    pub last_config_rendered: Option<chrono::DateTime<chrono::Utc>>,
    pub last_config_valid: Option<chrono::DateTime<chrono::Utc>>,
    pub last_proxy_reload: Option<chrono::DateTime<chrono::Utc>>,
}

/// A failed NGINX validation, carrying the rejected rendered text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    pub error: String,
    pub failed_config: String,
}

/// Read-only snapshot of the controller's pipeline state, served at
/// `GET /bt/status/`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Status {
    pub last_updated: Updates,
    pub last_error: Option<String>,
    pub validation_error: Option<ValidationError>,
    /// Additive diagnostics, not part of the no-reload decision — see
    /// DESIGN.md's note on the size-only change-detection heuristic.
    pub last_config_hash: Option<String>,
}
