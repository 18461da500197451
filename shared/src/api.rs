//! HTTP admin API wire types and path constants.
//!
//! Grounded on `macwilam-linksense/shared/src/api.rs`'s
//! `pub mod endpoints` / `pub mod headers` convention, adapted to the
//! routes named in spec.md section 4.6.

use serde::{Deserialize, Serialize};

/// API endpoint paths.
pub mod endpoints {
    pub const INFO: &str = "/bt";
    pub const STATUS: &str = "/bt/status/";
    pub const CONFIG: &str = "/bt/config/";
    pub const RELOAD: &str = "/bt/reload/";
    pub const RELOAD_ALL: &str = "/bt/reloadall/";
}

/// HTTP headers used by the admin API.
pub mod headers {
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// Body of `GET /bt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub name: String,
    pub description: String,
    pub version: String,
}

impl Default for InfoResponse {
    fn default() -> Self {
        Self {
            name: "beethoven".to_string(),
            description: "Mesos/Marathon HTTP Proxy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Body of `POST /bt/reload/`'s response and of each outbound peer
/// call issued by `POST /bt/reloadall/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub status: String,
}

impl ReloadResponse {
    pub fn accepted() -> Self {
        Self {
            status: "reload signal queued".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_response_defaults() {
        let info = InfoResponse::default();
        assert_eq!(info.name, "beethoven");
        assert!(!info.version.is_empty());
    }
}
