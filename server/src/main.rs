//! beethoven: dynamic NGINX front-proxy controller.
//!
//! Process entry point: CLI parsing, logging setup, wiring of the
//! scheduler, the generator's throttle loop, and the HTTP admin API,
//! plus graceful shutdown.
//!
//! Grounded on `macwilam-linksense/server/src/main.rs`'s `Server`
//! struct (background task `JoinHandle`s tracked for graceful
//! shutdown, a `broadcast::Sender<()>` fanned out to each task) and
//! its `setup_shutdown_signal` (SIGTERM/SIGINT on Unix, falling back
//! to Ctrl+C elsewhere), adapted to beethoven's three long-lived
//! pieces: the scheduler's own watch loop, the generator's throttle
//! loop, and the axum HTTP server.

mod api;
mod config;
mod generator;
mod nginx;
mod scheduler;
mod tracker;

use anyhow::{Context, Result};
use clap::Parser;
use config::{CliArgs, Command, LiveConfig};
use generator::Generator;
use nginx::{NginxDriver, TokioProcessRunner};
use scheduler::marathon::MarathonScheduler;
use scheduler::swarm::SwarmScheduler;
use scheduler::{ReloadReceiver, Scheduler, RELOAD_QUEUE_CAPACITY};
use shared::config::SchedulerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Seconds to wait for the generator task to finish an in-flight
/// render cycle before aborting it during shutdown.
const GENERATOR_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

pub struct Server {
    scheduler: Arc<dyn Scheduler>,
    generator: Arc<Generator>,
    reload_rx: Option<ReloadReceiver>,
    listen_port: u32,
    state: api::AppState,
    generator_task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl Server {
    pub fn new(
        config_path: PathBuf,
        dryrun_override: bool,
        root_apps_override: bool,
        listen_port_override: Option<u32>,
    ) -> Result<Self> {
        // load_from_file layers BT_MARATHON_URLS/BT_USERNAME/BT_PASSWORD/
        // BT_FILTER_REGEX onto the parsed file config before returning it
        // (shared::Config::apply_env_overrides); there is no separate
        // override step here.
        let cfg = shared::Config::load_from_file(&config_path)
            .context("failed to load beethoven configuration")?;

        let tracker = Arc::new(tracker::Tracker::new());
        let live_config = Arc::new(LiveConfig::new(config_path.clone(), &cfg)?);

        let scheduler: Arc<dyn Scheduler> = match &cfg.scheduler {
            SchedulerConfig::Marathon(m) => Arc::new(MarathonScheduler::new(
                m.clone(),
                tracker.clone(),
                live_config.filter_handle(),
            )),
            SchedulerConfig::Swarm(s) => Arc::new(SwarmScheduler::new(s.clone(), tracker.clone())),
        };

        let nginx = NginxDriver::new(Box::new(TokioProcessRunner::new()));
        let dryrun = dryrun_override || cfg.dryrun;
        let root_apps = root_apps_override || cfg.root_apps;
        let listen_port = listen_port_override.unwrap_or(cfg.port);

        let generator = Arc::new(Generator::new(
            tracker.clone(),
            scheduler.clone(),
            nginx,
            live_config.clone(),
            PathBuf::from(&cfg.template),
            PathBuf::from(&cfg.nginx_config),
            root_apps,
            dryrun,
        ));

        let (reload_tx, reload_rx) = mpsc::channel(RELOAD_QUEUE_CAPACITY);

        let state = api::AppState {
            tracker,
            scheduler: scheduler.clone(),
            live_config,
            reload_tx,
            nginx_config_path: PathBuf::from(&cfg.nginx_config),
            peer_client: reqwest::Client::new(),
            scheme: cfg.scheme.clone(),
        };

        Ok(Self {
            scheduler,
            generator,
            reload_rx: Some(reload_rx),
            listen_port,
            state,
            generator_task_handle: None,
            shutdown_tx: None,
        })
    }

    /// Starts the scheduler's watch loop, the generator's throttle
    /// loop, and the HTTP admin API, then blocks on the HTTP server
    /// until a graceful shutdown signal arrives.
    pub async fn run(&mut self) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Returns immediately; spawns its own background task and
        // enqueues the initial reload signal (spec.md section 4.1).
        self.scheduler.watch(self.state.reload_tx.clone()).await;

        let reload_rx = self
            .reload_rx
            .take()
            .expect("Server::run is called at most once");
        let generator = self.generator.clone();
        let generator_shutdown_rx = shutdown_tx.subscribe();
        self.generator_task_handle = Some(tokio::spawn(async move {
            generator.run(reload_rx, generator_shutdown_rx).await;
        }));

        let app = api::create_router(self.state.clone());
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], self.listen_port as u16));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind HTTP admin API on {}", addr))?;

        info!(%addr, "HTTP admin API listening");

        let mut http_shutdown_rx = shutdown_tx.subscribe();
        let shutdown_signal = async move {
            let _ = http_shutdown_rx.recv().await;
            info!("HTTP admin API received shutdown signal");
        };

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| anyhow::anyhow!("HTTP admin API error: {}", e))?;

        Ok(())
    }

    /// Shutdown sequence: broadcast the signal, stop the scheduler's
    /// background work, then wait (with a timeout) for the generator
    /// task to finish its current cycle.
    pub async fn shutdown(&mut self) {
        info!("beethoven shutting down gracefully");

        if let Some(tx) = &self.shutdown_tx {
            if let Err(e) = tx.send(()) {
                warn!("failed to broadcast shutdown signal: {}", e);
            }
        }

        self.scheduler.shutdown().await;

        if let Some(handle) = self.generator_task_handle.take() {
            match tokio::time::timeout(
                std::time::Duration::from_secs(GENERATOR_SHUTDOWN_TIMEOUT_SECS),
                handle,
            )
            .await
            {
                Ok(Ok(())) => info!("generator task stopped cleanly"),
                Ok(Err(e)) => warn!("generator task panicked: {}", e),
                Err(_) => warn!("generator task shutdown timeout reached, aborting"),
            }
        }

        info!("beethoven shutdown complete");
    }
}

/// On Unix, handles SIGTERM and SIGINT. Elsewhere, falls back to
/// Ctrl+C. If signal registration itself fails, falls back to Ctrl+C
/// as well.
async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());

        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("failed to register signal handlers: {}", e);
                error!("falling back to Ctrl+C only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to wait for Ctrl+C: {}", e);
                } else {
                    info!("received Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to receive Ctrl+C signal: {}", e);
        } else {
            info!("received Ctrl+C");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();
    let Command::Serve {
        config,
        dryrun,
        root_apps,
        listen_port,
        log_dir,
    } = cli.command
    else {
        unreachable!("Command has a single variant, Serve");
    };

    let file_appender = tracing_appender::rolling::daily(&log_dir, "beethoven.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Suppresses the Marathon HTTP client's own request/response trace
    // logging by default, mirroring `original_source/scheduler/
    // marathon.go`'s `logger.SetLevel(logger.WARNING, "client")`.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("server=info,shared=info,reqwest=warn,hyper=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    info!(config = %config.display(), "beethoven starting up");

    let mut server = match Server::new(config, dryrun, root_apps, listen_port) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize beethoven: {}", e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("server error: {}", e);
                std::process::exit(1);
            }
        }
        _ = setup_shutdown_signal() => {
            info!("shutdown signal received, initiating graceful shutdown");
        }
    }

    server.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn server_new_succeeds_with_valid_marathon_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            scheduler_type = 1
            port = 9090

            [marathon]
            endpoints = ["http://localhost:8080"]
        "#
        )
        .unwrap();

        let server = Server::new(file.path().to_path_buf(), false, false, None);
        assert!(server.is_ok());
        assert_eq!(server.unwrap().listen_port, 9090);
    }

    #[test]
    fn server_new_listen_port_override_wins_over_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            scheduler_type = 1
            port = 9090

            [marathon]
            endpoints = ["http://localhost:8080"]
        "#
        )
        .unwrap();

        let server = Server::new(file.path().to_path_buf(), false, false, Some(7070)).unwrap();
        assert_eq!(server.listen_port, 7070);
    }

    #[test]
    fn server_new_fails_on_missing_config_file() {
        let server = Server::new(PathBuf::from("/nonexistent/beethoven.toml"), false, false, None);
        assert!(server.is_err());
    }
}
