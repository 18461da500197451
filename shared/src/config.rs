//! Config file schema.
//!
//! The top-level [`Config`] uses a hand-written [`serde::de::Visitor`]
//! to resolve `scheduler_type` against the `marathon`/`swarm` blocks
//! the same way `macwilam-linksense/shared/src/config.rs`'s
//! `TaskConfig` resolves its `type` tag against task-specific
//! parameter blocks: collect every key first, then dispatch on the
//! already-parsed tag rather than on which fields happen to be
//! present. See spec.md section 9 and
//! `original_source/config/config_test.go`'s
//! `TestSchedulerTypeIsValid` for the exact precedence rule this
//! encodes (explicit `scheduler_type` wins when both blocks are set).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

fn default_port() -> u32 {
    7777
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_template() -> String {
    "/etc/nginx/nginx.template".to_string()
}

fn default_nginx_config() -> String {
    "/etc/nginx/nginx.conf".to_string()
}

fn default_watch_interval_secs() -> u64 {
    10
}

fn default_tls_verify() -> bool {
    true
}

/// Which upstream scheduler this controller watches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerType {
    Marathon = 1,
    Swarm = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarathonConfig {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Marathon app ID identifying this process, used by
    /// `fetch_peer_instances` to enumerate siblings.
    #[serde(default)]
    pub service_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    pub endpoint: String,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default, rename = "route_to_node")]
    pub route_to_node: bool,
    #[serde(default = "default_watch_interval_secs")]
    pub watch_interval_secs: u64,
    #[serde(default)]
    pub tls_cert: String,
    #[serde(default)]
    pub tls_key: String,
    #[serde(default)]
    pub tlsca_cert: String,
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
}

fn default_network() -> String {
    "ingress".to_string()
}

/// Tagged variant over the two supported schedulers.
///
/// Deserialized by hand in [`Config`]'s `Visitor` impl rather than via
/// `#[serde(tag = "scheduler_type")]`, because the tag here is a
/// sibling field of the whole config object, not of this enum's own
/// table.
#[derive(Debug, Clone, Serialize)]
pub enum SchedulerConfig {
    Marathon(MarathonConfig),
    Swarm(SwarmConfig),
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub port: u32,
    pub scheme: String,
    pub template: String,
    pub nginx_config: String,
    pub filter_regex: String,
    pub root_apps: bool,
    pub dryrun: bool,
    pub data: HashMap<String, serde_json::Value>,
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let mut cfg: Config = toml::from_str(&text)
            .map_err(|e| crate::Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Layers startup environment variable overrides onto the file
    /// config: `BT_MARATHON_URLS` (comma-split into marathon
    /// endpoints), `BT_USERNAME`/`BT_PASSWORD` (marathon credentials),
    /// and `BT_FILTER_REGEX`. Applied once here, at load time, and
    /// never re-read afterward — a later `reload()` re-reads the file
    /// but does not re-touch the environment (spec.md section 6).
    ///
    /// Takes the lookup as a closure rather than calling `std::env::var`
    /// directly so tests can supply a fixed map instead of mutating
    /// process environment.
    pub fn apply_env_overrides(&mut self, getenv: impl Fn(&str) -> Option<String>) {
        if let SchedulerConfig::Marathon(m) = &mut self.scheduler {
            if let Some(urls) = getenv("BT_MARATHON_URLS") {
                m.endpoints = urls
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            if let Some(username) = getenv("BT_USERNAME") {
                m.username = username;
            }
            if let Some(password) = getenv("BT_PASSWORD") {
                m.password = password;
            }
        }
        if let Some(filter_regex) = getenv("BT_FILTER_REGEX") {
            self.filter_regex = filter_regex;
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        match &self.scheduler {
            SchedulerConfig::Marathon(m) if m.endpoints.is_empty() => {
                Err(crate::Error::ConfigLoad(
                    "marathon.endpoints must not be empty".to_string(),
                )
                .into())
            }
            SchedulerConfig::Swarm(s) if s.endpoint.is_empty() => {
                Err(crate::Error::ConfigLoad("swarm.endpoint must not be empty".to_string()).into())
            }
            _ => Ok(()),
        }
    }

    pub fn is_filter_defined(&self) -> bool {
        !self.filter_regex.is_empty()
    }

    pub fn filter(&self) -> crate::Result<Option<regex::Regex>> {
        if self.is_filter_defined() {
            Ok(Some(regex::Regex::new(&self.filter_regex)?))
        } else {
            Ok(None)
        }
    }
}

impl<'de> Deserialize<'de> for Config {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{Error, MapAccess, Visitor};
        use std::fmt;

        struct ConfigVisitor;

        impl<'de> Visitor<'de> for ConfigVisitor {
            type Value = Config;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a beethoven config object")
            }

            fn visit_map<V>(self, mut map: V) -> Result<Config, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut scheduler_type: Option<u8> = None;
                let mut marathon_table: Option<toml::Value> = None;
                let mut swarm_table: Option<toml::Value> = None;
                let mut port: Option<u32> = None;
                let mut scheme: Option<String> = None;
                let mut template: Option<String> = None;
                let mut nginx_config: Option<String> = None;
                let mut filter_regex: Option<String> = None;
                let mut root_apps: Option<bool> = None;
                let mut dryrun: Option<bool> = None;
                let mut data: Option<HashMap<String, serde_json::Value>> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "scheduler_type" => scheduler_type = Some(map.next_value()?),
                        "marathon" => marathon_table = Some(map.next_value()?),
                        "swarm" => swarm_table = Some(map.next_value()?),
                        "port" => port = Some(map.next_value()?),
                        "scheme" => scheme = Some(map.next_value()?),
                        "template" => template = Some(map.next_value()?),
                        "nginx_config" => nginx_config = Some(map.next_value()?),
                        "filter_regex" => filter_regex = Some(map.next_value()?),
                        "root_apps" => root_apps = Some(map.next_value()?),
                        "dryrun" => dryrun = Some(map.next_value()?),
                        "data" => data = Some(map.next_value()?),
                        _ => {
                            let _: toml::Value = map.next_value()?;
                        }
                    }
                }

                // scheduler_type is authoritative when present; otherwise infer
                // from which block was supplied (marathon preferred on
                // ambiguity, matching original_source/config/config.go's
                // precedence when both are populated but no tag is set).
                let inferred = scheduler_type.unwrap_or(if marathon_table.is_some() {
                    1
                } else {
                    2
                });

                let scheduler = match inferred {
                    1 => {
                        let table = marathon_table.ok_or_else(|| {
                            Error::custom("scheduler_type is marathon but [marathon] block is missing")
                        })?;
                        let cfg: MarathonConfig = table
                            .try_into()
                            .map_err(|e| Error::custom(format!("invalid [marathon] block: {}", e)))?;
                        SchedulerConfig::Marathon(cfg)
                    }
                    2 => {
                        let table = swarm_table.ok_or_else(|| {
                            Error::custom("scheduler_type is swarm but [swarm] block is missing")
                        })?;
                        let cfg: SwarmConfig = table
                            .try_into()
                            .map_err(|e| Error::custom(format!("invalid [swarm] block: {}", e)))?;
                        SchedulerConfig::Swarm(cfg)
                    }
                    other => return Err(Error::custom(format!("unknown scheduler_type: {}", other))),
                };

                Ok(Config {
                    scheduler,
                    port: port.unwrap_or_else(default_port),
                    scheme: scheme.unwrap_or_else(default_scheme),
                    template: template.unwrap_or_else(default_template),
                    nginx_config: nginx_config.unwrap_or_else(default_nginx_config),
                    filter_regex: filter_regex.unwrap_or_default(),
                    root_apps: root_apps.unwrap_or(false),
                    dryrun: dryrun.unwrap_or(false),
                    data: data.unwrap_or_default(),
                })
            }
        }

        deserializer.deserialize_map(ConfigVisitor)
    }
}
