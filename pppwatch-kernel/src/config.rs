use crate::models::InterfaceKind;
use crate::sampling::EvictionPolicy;
use crate::scheduler::{system_clock, MonitorSettings};
use crate::upstream::RouterEndpoint;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{collections::BTreeMap, time::Duration};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    /// Absent du fichier : pas de bus MQTT
    #[serde(default)]
    pub mqtt: Option<MqttConf>,
    pub monitor: MonitorConf,
    pub routers: BTreeMap<String, RouterConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConf {
    /// 0 = pas de refresh par timer
    pub default_refresh_secs: u64,
    pub fetch_timeout_secs: u64,
    pub evict_after_cycles: Option<u32>,
    pub baseline_dir: Option<PathBuf>,
    pub monitored_kind: InterfaceKind,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RouterConf {
    pub name: Option<String>,
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub refresh_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self {
            default_refresh_secs: 5,
            fetch_timeout_secs: 10,
            evict_after_cycles: None,
            baseline_dir: None,
            monitored_kind: InterfaceKind::PppoeIn,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http: HttpConf::default(),
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
            monitor: MonitorConf::default(),
            routers: BTreeMap::new(),
        }
    }
}

impl RouterConf {
    pub fn endpoint(&self) -> RouterEndpoint {
        RouterEndpoint {
            base_url: self.base_url.clone(),
            username: self.username.clone().filter(|u| !u.is_empty()),
            password: self.password.clone(),
        }
    }

    pub fn display_name<'a>(&'a self, router_id: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(router_id)
    }
}

impl KernelConfig {
    pub fn monitor_settings(&self, router: Option<&RouterConf>) -> MonitorSettings {
        let refresh_secs = router
            .and_then(|r| r.refresh_secs)
            .unwrap_or(self.monitor.default_refresh_secs);
        MonitorSettings {
            refresh_interval: Duration::from_secs(refresh_secs),
            fetch_timeout: Duration::from_secs(self.monitor.fetch_timeout_secs.max(1)),
            monitored_kind: self.monitor.monitored_kind,
            eviction: EvictionPolicy::from_config(self.monitor.evict_after_cycles),
            clock: system_clock(),
        }
    }
}

pub fn parse_config(txt: &str) -> Result<KernelConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("PPPWATCH_CONFIG").unwrap_or_else(|_| "pppwatch.yaml".into());
    if !Path::new(&path).exists() {
        warn!(path = %path, "config file not found, using defaults");
        return KernelConfig::default();
    }
    let txt = match fs::read_to_string(&path).await {
        Ok(txt) => txt,
        Err(e) => {
            warn!(path = %path, error = %e, "config unreadable, using defaults");
            return KernelConfig::default();
        }
    };
    match parse_config(&txt) {
        Ok(cfg) => {
            info!(path = %path, routers = cfg.routers.len(), "config loaded");
            cfg
        }
        Err(e) => {
            warn!(path = %path, error = %e, "invalid config, using defaults");
            KernelConfig::default()
        }
    }
}
