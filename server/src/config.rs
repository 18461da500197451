//! CLI argument parsing and the live, hot-reloadable subset of
//! configuration.
//!
//! Grounded on `original_source/beethoven.go`'s cobra `serve` command
//! (subcommand + flags) and `original_source/config/config.go`'s
//! env-var-prefixed file loading, adapted to `clap::Parser` following
//! `macwilam-linksense/server/src/main.rs`'s `CliArgs` derive shape.
//! The hot-reloadable subset (spec.md section 4.7) mirrors
//! `macwilam-linksense/server/src/config.rs`'s `ConfigManager` of
//! wrapping live state behind a lock both a background task and the
//! HTTP API can touch.

use clap::{Parser, Subcommand};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Parser, Debug)]
#[command(name = "beethoven")]
#[command(about = "Dynamic NGINX front-proxy controller for Marathon/Mesos and Docker Swarm")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch topology, render the NGINX template, validate and reload.
    Serve {
        /// Path to the local configuration file.
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Skip NGINX validation and reload; render and log only.
        #[arg(long)]
        dryrun: bool,

        /// Use Apps as the template root instead of the whole TemplateData.
        #[arg(long)]
        root_apps: bool,

        /// Override the HTTP admin API listen port from the config file.
        #[arg(long, value_name = "PORT")]
        listen_port: Option<u32>,

        /// Directory for the rolling daily log file.
        #[arg(long, value_name = "DIR", default_value = "./logs")]
        log_dir: PathBuf,
    },
}

/// The subset of configuration that may change without a process
/// restart: the free-form template `data` and the filter regex.
/// Scheduler endpoints and the listen port are NOT hot-reloadable
/// (spec.md section 4.7).
pub struct LiveConfig {
    path: PathBuf,
    data: RwLock<HashMap<String, serde_json::Value>>,
    filter: Arc<RwLock<Option<Regex>>>,
}

impl LiveConfig {
    pub fn new(path: PathBuf, initial: &shared::Config) -> shared::Result<Self> {
        let filter = initial.filter()?;
        Ok(Self {
            path,
            data: RwLock::new(initial.data.clone()),
            filter: Arc::new(RwLock::new(filter)),
        })
    }

    pub async fn data(&self) -> HashMap<String, serde_json::Value> {
        self.data.read().await.clone()
    }

    pub async fn filter(&self) -> Option<Regex> {
        self.filter.read().await.clone()
    }

    /// Shared handle onto the filter regex, so a scheduler's own event
    /// listener (e.g. Marathon's SSE stream) observes the same regex
    /// `reload()` updates, instead of a stale copy of its own.
    pub fn filter_handle(&self) -> Arc<RwLock<Option<Regex>>> {
        self.filter.clone()
    }

    /// Re-reads the config file from disk and refreshes `data` and the
    /// filter regex. An invalid regex disables the filter and logs a
    /// warning rather than failing the reload.
    pub async fn reload(&self) -> shared::Result<()> {
        let fresh = shared::Config::load_from_file(&self.path)?;
        *self.data.write().await = fresh.data.clone();

        match fresh.filter() {
            Ok(re) => *self.filter.write().await = re,
            Err(e) => {
                tracing::warn!(error = %e, "invalid filter_regex on reload, disabling filter");
                *self.filter.write().await = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[tokio::test]
    async fn reload_picks_up_new_data_and_filter() {
        let file = write_config(
            r#"
            scheduler_type = 1
            filter_regex = "^web.*"

            [marathon]
            endpoints = ["http://localhost:8080"]

            [data]
            region = "us-east"
        "#,
        );
        let initial = shared::Config::load_from_file(file.path()).unwrap();
        let live = LiveConfig::new(file.path().to_path_buf(), &initial).unwrap();
        assert!(live.filter().await.is_some());
        assert_eq!(
            live.data().await.get("region").and_then(|v| v.as_str()),
            Some("us-east")
        );

        std::fs::write(
            file.path(),
            r#"
            scheduler_type = 1
            filter_regex = ""

            [marathon]
            endpoints = ["http://localhost:8080"]

            [data]
            region = "eu-west"
        "#,
        )
        .unwrap();

        live.reload().await.unwrap();
        assert!(live.filter().await.is_none());
        assert_eq!(
            live.data().await.get("region").and_then(|v| v.as_str()),
            Some("eu-west")
        );
    }

    #[tokio::test]
    async fn reload_with_bad_regex_disables_filter() {
        let file = write_config(
            r#"
            scheduler_type = 1
            filter_regex = "^web.*"

            [marathon]
            endpoints = ["http://localhost:8080"]
        "#,
        );
        let initial = shared::Config::load_from_file(file.path()).unwrap();
        let live = LiveConfig::new(file.path().to_path_buf(), &initial).unwrap();

        std::fs::write(
            file.path(),
            r#"
            scheduler_type = 1
            filter_regex = "("

            [marathon]
            endpoints = ["http://localhost:8080"]
        "#,
        )
        .unwrap();

        live.reload().await.unwrap();
        assert!(live.filter().await.is_none());
    }
}
