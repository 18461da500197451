//! Swarm scheduler: polls the Docker Engine API at an interval since
//! Marathon-style event streams aren't available on Swarm (spec.md
//! section 4.3).
//!
//! `original_source/scheduler/swarm.go` only survived the retrieval
//! filter as a thin MVP stub (`Watch`/`Shutdown`/`FetchApps` returning
//! empty), so this adapter is grounded primarily on spec.md's textual
//! description of the polling/VIP-resolution/round-robin algorithm,
//! with the shared-mutable-state discipline
//! (`Arc<RwLock<Vec<...>>>` guarding the healthy-node list, written by
//! the poll loop and read by `FetchApps`) taken from spec.md section 9
//! item 3 and from `macwilam-linksense/agent/src/scheduler.rs`'s
//! ticker-task idiom.

use super::{try_signal_reload, ReloadSender, Scheduler};
use crate::tracker::Tracker;
use async_trait::async_trait;
use serde::Deserialize;
use shared::{App, PeerInstance, SwarmConfig, Task};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Deserialize)]
struct SwarmPort {
    #[serde(rename = "TargetPort")]
    target_port: u32,
    #[serde(rename = "PublishedPort")]
    published_port: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmVirtualIp {
    #[serde(rename = "NetworkID")]
    network_id: String,
    #[serde(rename = "Addr")]
    addr: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmEndpoint {
    #[serde(default, rename = "Ports")]
    ports: Vec<SwarmPort>,
    #[serde(default, rename = "VirtualIPs")]
    virtual_ips: Vec<SwarmVirtualIp>,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmServiceSpec {
    #[serde(rename = "Name")]
    name: String,
    #[serde(default, rename = "Labels")]
    labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmService {
    #[serde(rename = "Spec")]
    spec: SwarmServiceSpec,
    #[serde(rename = "Endpoint")]
    endpoint: SwarmEndpoint,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmNetwork {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmNodeStatus {
    #[serde(rename = "State")]
    state: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmManagerStatus {}

#[derive(Debug, Clone, Default, Deserialize)]
struct SwarmNodeDescription {
    #[serde(default, rename = "Hostname")]
    hostname: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SwarmNode {
    #[serde(rename = "Status")]
    status: SwarmNodeStatus,
    #[serde(default, rename = "ManagerStatus")]
    manager_status: Option<SwarmManagerStatus>,
    #[serde(default, rename = "Description")]
    description: SwarmNodeDescription,
}

/// A resolved, comparable snapshot of one Swarm service, used to
/// decide whether topology has changed between polls (spec.md section
/// 4.3 step 4).
#[derive(Debug, Clone, PartialEq)]
struct ServiceData {
    name: String,
    labels: HashMap<String, String>,
    published_port: Option<u32>,
    target_port: Option<u32>,
    address: Option<String>,
}

fn resolve_vip<'a>(
    endpoint: &'a SwarmEndpoint,
    networks_by_id: &HashMap<String, String>,
    configured_network: &str,
) -> Option<&'a str> {
    let order = [configured_network, "ingress"];
    for candidate in order {
        if candidate.is_empty() {
            continue;
        }
        if let Some(vip) = endpoint.virtual_ips.iter().find(|v| {
            networks_by_id
                .get(&v.network_id)
                .map(|n| n == candidate)
                .unwrap_or(false)
        }) {
            return Some(&vip.addr);
        }
    }
    endpoint.virtual_ips.first().map(|v| v.addr.as_str())
}

fn to_service_data(
    svc: &SwarmService,
    networks_by_id: &HashMap<String, String>,
    configured_network: &str,
) -> ServiceData {
    let port = svc.endpoint.ports.first();
    let address = resolve_vip(&svc.endpoint, networks_by_id, configured_network)
        .map(|s| s.split('/').next().unwrap_or(s).to_string());
    ServiceData {
        name: svc.spec.name.clone(),
        labels: svc.spec.labels.clone(),
        published_port: port.map(|p| p.published_port),
        target_port: port.map(|p| p.target_port),
        address,
    }
}

fn urlencode_overlay_filter() -> &'static str {
    // {"driver":["overlay"]}
    "%7B%22driver%22%3A%5B%22overlay%22%5D%7D"
}

async fn list_services(client: &reqwest::Client, endpoint: &str) -> shared::Result<Vec<SwarmService>> {
    let url = format!("{}/services", endpoint.trim_end_matches('/'));
    client
        .get(&url)
        .send()
        .await
        .map_err(|e| shared::Error::SchedulerFetch(e.to_string()))?
        .json()
        .await
        .map_err(|e| shared::Error::SchedulerFetch(e.to_string()).into())
}

async fn list_overlay_networks(
    client: &reqwest::Client,
    endpoint: &str,
) -> shared::Result<HashMap<String, String>> {
    let url = format!(
        "{}/networks?filters={}",
        endpoint.trim_end_matches('/'),
        urlencode_overlay_filter()
    );
    let networks: Vec<SwarmNetwork> = client
        .get(&url)
        .send()
        .await
        .map_err(|e| shared::Error::SchedulerFetch(e.to_string()))?
        .json()
        .await
        .map_err(|e| shared::Error::SchedulerFetch(e.to_string()))?;
    Ok(networks.into_iter().map(|n| (n.id, n.name)).collect())
}

async fn list_healthy_worker_nodes(
    client: &reqwest::Client,
    endpoint: &str,
) -> shared::Result<Vec<String>> {
    let url = format!("{}/nodes", endpoint.trim_end_matches('/'));
    let nodes: Vec<SwarmNode> = client
        .get(&url)
        .send()
        .await
        .map_err(|e| shared::Error::SchedulerFetch(e.to_string()))?
        .json()
        .await
        .map_err(|e| shared::Error::SchedulerFetch(e.to_string()))?;
    Ok(nodes
        .into_iter()
        .filter(|n| n.status.state == "ready" && n.manager_status.is_none())
        .map(|n| n.description.hostname)
        .collect())
}

/// Whether a refreshed healthy-node list should rewind the round-robin
/// index to 0. Design Notes (spec.md section 9) call for a reset when
/// the list is replaced by one of equal or smaller size, broader than
/// a strict shrink.
fn list_replaced_with_reset(old_len: usize, new_len: usize) -> bool {
    new_len <= old_len
}

/// Round-robin over the healthy worker list. A shrinking list resets
/// the index to 0 (spec.md invariant 9).
fn next_node_address(healthy: &[String], index: &AtomicUsize) -> Option<String> {
    if healthy.is_empty() {
        return None;
    }
    let i = index.fetch_add(1, Ordering::Relaxed) % healthy.len();
    Some(healthy[i].clone())
}

/// Shared state behind the scheduler, refreshed by the poll loop and
/// read by `fetch_apps` — plain fields rather than a `SwarmScheduler`
/// method so the background task can hold `Arc` clones of just this,
/// without requiring `Arc<Self>` inside `watch(&self, ...)`.
struct SharedState {
    client: reqwest::Client,
    config: SwarmConfig,
    tracker: Arc<Tracker>,
    services: RwLock<Vec<ServiceData>>,
    healthy_nodes: RwLock<Vec<String>>,
    round_robin_index: AtomicUsize,
}

impl SharedState {
    async fn poll_and_maybe_signal(&self, reload_tx: &ReloadSender) -> shared::Result<()> {
        let fresh = self.refresh_services().await?;

        if self.config.route_to_node {
            let healthy = list_healthy_worker_nodes(&self.client, &self.config.endpoint).await?;
            let reset = list_replaced_with_reset(self.healthy_nodes.read().await.len(), healthy.len());
            *self.healthy_nodes.write().await = healthy;
            if reset {
                self.round_robin_index.store(0, Ordering::Relaxed);
            }
        }

        let changed = *self.services.read().await != fresh;
        if changed {
            *self.services.write().await = fresh;
            try_signal_reload(reload_tx);
        }
        self.tracker.set_last_sync().await;
        Ok(())
    }

    async fn refresh_services(&self) -> shared::Result<Vec<ServiceData>> {
        let raw = list_services(&self.client, &self.config.endpoint).await?;
        let networks = list_overlay_networks(&self.client, &self.config.endpoint).await?;
        let mut fresh: Vec<ServiceData> = raw
            .iter()
            .map(|s| to_service_data(s, &networks, &self.config.network))
            .collect();
        fresh.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(fresh)
    }
}

pub struct SwarmScheduler {
    state: Arc<SharedState>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmScheduler {
    pub fn new(config: SwarmConfig, tracker: Arc<Tracker>) -> Self {
        Self {
            state: Arc::new(SharedState {
                client: reqwest::Client::new(),
                config,
                tracker,
                services: RwLock::new(Vec::new()),
                healthy_nodes: RwLock::new(Vec::new()),
                round_robin_index: AtomicUsize::new(0),
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Scheduler for SwarmScheduler {
    async fn watch(&self, reload_tx: ReloadSender) {
        try_signal_reload(&reload_tx);

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        let interval = std::time::Duration::from_secs(state.config.watch_interval_secs.max(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = state.poll_and_maybe_signal(&reload_tx).await {
                    tracing::warn!(error = %e, "swarm poll failed, will retry next tick");
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn fetch_apps(&self) -> shared::Result<HashMap<String, App>> {
        // Always reconcile against current scheduler state, not an
        // event payload (spec.md section 5): refresh synchronously
        // rather than trusting the poll loop's last snapshot.
        let fresh = self.state.refresh_services().await?;
        *self.state.services.write().await = fresh;

        let services = self.state.services.read().await;
        let healthy = self.state.healthy_nodes.read().await;
        let mut result = HashMap::new();
        for svc in services.iter() {
            let (Some(target_port), Some(published_port)) = (svc.target_port, svc.published_port)
            else {
                continue;
            };
            let host = if self.state.config.route_to_node {
                match next_node_address(&healthy, &self.state.round_robin_index) {
                    Some(h) => h,
                    None => continue,
                }
            } else {
                match &svc.address {
                    Some(a) => a.clone(),
                    None => continue,
                }
            };
            let task = Task {
                host,
                ports: vec![target_port],
                service_ports: vec![published_port],
                staged_at: String::new(),
                started_at: String::new(),
                version: String::new(),
            };
            result.insert(
                svc.name.clone(),
                App {
                    app_id: svc.name.clone(),
                    tasks: vec![task],
                    labels: svc.labels.clone(),
                    env: HashMap::new(),
                },
            );
        }
        Ok(result)
    }

    async fn fetch_peer_instances(&self) -> shared::Result<Vec<PeerInstance>> {
        // Peer fan-out is only supported under Marathon in this core
        // (spec.md section 4.3).
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_and_resets_on_shrink() {
        let index = AtomicUsize::new(0);
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(next_node_address(&three, &index), Some("a".to_string()));
        assert_eq!(next_node_address(&three, &index), Some("b".to_string()));
        assert_eq!(next_node_address(&three, &index), Some("c".to_string()));
        assert_eq!(next_node_address(&three, &index), Some("a".to_string()));

        assert_eq!(next_node_address(&[], &index), None);
    }

    #[test]
    fn list_replaced_with_reset_covers_equal_and_shrinking_sizes() {
        assert!(list_replaced_with_reset(3, 2), "strict shrink resets");
        assert!(list_replaced_with_reset(3, 3), "equal size resets");
        assert!(!list_replaced_with_reset(3, 4), "growth does not reset");
        assert!(list_replaced_with_reset(0, 0));
    }

    #[test]
    fn vip_resolution_prefers_configured_network_then_ingress_then_first() {
        let mut networks = HashMap::new();
        networks.insert("net-ingress".to_string(), "ingress".to_string());
        networks.insert("net-custom".to_string(), "custom".to_string());

        let endpoint = SwarmEndpoint {
            ports: vec![],
            virtual_ips: vec![
                SwarmVirtualIp {
                    network_id: "net-ingress".to_string(),
                    addr: "10.0.0.1/24".to_string(),
                },
                SwarmVirtualIp {
                    network_id: "net-custom".to_string(),
                    addr: "10.0.1.1/24".to_string(),
                },
            ],
        };

        assert_eq!(resolve_vip(&endpoint, &networks, "custom"), Some("10.0.1.1/24"));
        assert_eq!(resolve_vip(&endpoint, &networks, ""), Some("10.0.0.1/24"));
    }

    #[test]
    fn service_equality_detects_port_change() {
        let a = ServiceData {
            name: "svc".to_string(),
            labels: HashMap::new(),
            published_port: Some(80),
            target_port: Some(8080),
            address: Some("10.0.0.1".to_string()),
        };
        let mut b = a.clone();
        b.published_port = Some(8081);
        assert_ne!(a, b);
    }
}
