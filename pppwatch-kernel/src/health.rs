use crate::mqtt::{BusPublisher, HEALTH_TOPIC};
use crate::registry::SharedRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub routers_monitored: u32,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    /// Pas de bus configuré
    pub fn mark_mqtt_disabled(&self) {
        *self.mqtt_status.lock() = "disabled".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, registry: &SharedRegistry) -> KernelHealth {
        let (cycles_ok, cycles_failed) = registry.cycle_totals();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            routers_monitored: registry.len() as u32,
            cycles_ok,
            cycles_failed,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publication périodique du health kernel sur le bus
    pub fn spawn_health_publisher(
        &self,
        registry: SharedRegistry,
        publisher: Arc<dyn BusPublisher>,
        period: Duration,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&registry);
                let payload = match serde_json::to_vec(&health) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize kernel health");
                        continue;
                    }
                };
                match publisher.publish(HEALTH_TOPIC, payload).await {
                    Ok(()) => debug!(
                        uptime = health.uptime_seconds,
                        routers = health.routers_monitored,
                        "published kernel health"
                    ),
                    Err(e) => warn!(error = %e, "failed to publish kernel health"),
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
