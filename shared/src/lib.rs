//! Shared data structures and configuration schema for the beethoven
//! proxy controller.
//!
//! This crate contains the canonical App/Task/TemplateData types that
//! cross the scheduler/generator/HTTP boundary, the config file
//! schema, and the HTTP admin API's wire types.

pub mod api;
pub mod config;
pub mod model;

pub use api::{endpoints, headers};
pub use config::{Config, MarathonConfig, SchedulerType, SwarmConfig};
pub use model::{App, PeerInstance, Status, Task, TemplateData, Updates, ValidationError};

/// Result type alias used throughout the shared crate.
pub type Result<T> = anyhow::Result<T>;

/// Domain error kinds, by origin (see spec.md section 7).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config load failed: {0}")]
    ConfigLoad(String),

    #[error("scheduler fetch failed: {0}")]
    SchedulerFetch(String),

    #[error("template render failed: {0}")]
    TemplateRender(String),

    #[error("nginx config validation failed: {stderr}")]
    Validation { stderr: String, rendered: String },

    #[error("nginx exec failed: {stderr}")]
    ExecNginx { stderr: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("peer fan-out error for {peer}: {source}")]
    PeerFanout { peer: String, source: String },
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_basic_imports() {
        let _ = super::Error::ConfigLoad("x".into());
    }
}
