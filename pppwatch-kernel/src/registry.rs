/**
 * REGISTRE DES ROUTEURS - Point d'entrée des consommateurs (API REST, bus, UI)
 *
 * RÔLE :
 * Associe chaque identifiant de routeur à son `RouterMonitor`. Aucun état global :
 * chaque contexte est créé à l'attachement et détruit au détachement.
 *
 * FONCTIONNEMENT :
 * - attach/detach : cycle de vie d'un contexte (un seul par routeur)
 * - snapshot / set_refresh_interval / refresh_now / subscribe : délégués au contexte
 * - deliver_push : ingestion du payload brut puis remise au contexte concerné
 * - subscribe_all : callback posé sur tous les routeurs, présents et futurs
 */

use crate::baseline::BaselineStore;
use crate::error::MonitorError;
use crate::ingest::PushPayload;
use crate::models::{MonitorState, RouterId, Snapshot};
use crate::scheduler::{Callback, MonitorSettings, RouterMonitor, SubscriptionId};
use crate::upstream::RouterApi;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

pub type SharedRegistry = Arc<MonitorRegistry>;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub name: String,
    pub monitor: MonitorSettings,
}

/// Vue d'un routeur supervisé pour GET /routers
#[derive(Debug, Clone, Serialize)]
pub struct RouterInfo {
    pub router_id: RouterId,
    pub name: String,
    pub state: MonitorState,
    pub sequence: u64,
    pub refresh_interval_secs: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

struct Entry {
    name: String,
    monitor: RouterMonitor,
}

pub struct MonitorRegistry {
    api: Arc<dyn RouterApi>,
    store: Arc<dyn BaselineStore>,
    routers: RwLock<BTreeMap<RouterId, Entry>>,
    global_callbacks: Mutex<Vec<Callback>>,
}

impl MonitorRegistry {
    pub fn new(api: Arc<dyn RouterApi>, store: Arc<dyn BaselineStore>) -> Self {
        Self {
            api,
            store,
            routers: RwLock::new(BTreeMap::new()),
            global_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Crée le contexte du routeur ; un contexte existant est arrêté et remplacé
    pub fn attach(&self, router_id: &str, settings: RouterSettings) {
        // même ordre de verrous que subscribe_all : routers puis global_callbacks.
        // Les callbacks globaux sont inscrits avant que la tâche ne tourne.
        let mut routers = self.routers.write();
        let callbacks = self.global_callbacks.lock().clone();
        let monitor = RouterMonitor::spawn_with_subscribers(
            router_id,
            self.api.clone(),
            self.store.clone(),
            settings.monitor,
            callbacks,
        );
        let previous = routers.insert(
            router_id.to_string(),
            Entry {
                name: settings.name,
                monitor,
            },
        );
        drop(routers);
        if let Some(old) = previous {
            warn!(router = router_id, "router attached twice, previous monitor replaced");
            old.monitor.shutdown();
        }
        info!(router = router_id, "router attached");
    }

    pub fn detach(&self, router_id: &str) -> Result<(), MonitorError> {
        let entry = self
            .routers
            .write()
            .remove(router_id)
            .ok_or_else(|| MonitorError::UnknownRouter(router_id.to_string()))?;
        entry.monitor.shutdown();
        info!(router = router_id, "router detached");
        Ok(())
    }

    fn with_monitor<T>(
        &self,
        router_id: &str,
        f: impl FnOnce(&RouterMonitor) -> Result<T, MonitorError>,
    ) -> Result<T, MonitorError> {
        let routers = self.routers.read();
        let entry = routers
            .get(router_id)
            .ok_or_else(|| MonitorError::UnknownRouter(router_id.to_string()))?;
        f(&entry.monitor)
    }

    pub fn snapshot(&self, router_id: &str) -> Result<Arc<Snapshot>, MonitorError> {
        self.with_monitor(router_id, |m| Ok(m.snapshot()))
    }

    pub fn set_refresh_interval(&self, router_id: &str, seconds: u64) -> Result<(), MonitorError> {
        self.with_monitor(router_id, |m| m.set_refresh_interval(Duration::from_secs(seconds)))
    }

    pub fn refresh_now(&self, router_id: &str) -> Result<(), MonitorError> {
        self.with_monitor(router_id, |m| m.refresh_now())
    }

    pub fn subscribe(&self, router_id: &str, callback: Callback) -> Result<SubscriptionId, MonitorError> {
        self.with_monitor(router_id, |m| Ok(m.subscribe(callback)))
    }

    pub fn unsubscribe(&self, router_id: &str, id: SubscriptionId) -> Result<bool, MonitorError> {
        self.with_monitor(router_id, |m| Ok(m.unsubscribe(id)))
    }

    /// Callback posé sur tous les routeurs, y compris ceux attachés plus tard
    pub fn subscribe_all(&self, callback: Callback) {
        let routers = self.routers.write();
        for entry in routers.values() {
            entry.monitor.subscribe(callback.clone());
        }
        self.global_callbacks.lock().push(callback);
    }

    /// Ingestion du payload et remise au contexte ; retourne le nombre d'enregistrements rejetés
    pub fn deliver_push(&self, payload: PushPayload) -> Result<usize, MonitorError> {
        let received_at = OffsetDateTime::now_utc();
        let (sets, rejected) = payload.into_record_sets(received_at);
        let sampled_at = payload.sampled_at.unwrap_or(received_at);
        self.with_monitor(&payload.router_id, |m| m.deliver_push(sets, sampled_at))?;
        Ok(rejected)
    }

    pub fn router_ids(&self) -> Vec<RouterId> {
        self.routers.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.read().is_empty()
    }

    pub fn list(&self) -> Vec<RouterInfo> {
        self.routers
            .read()
            .iter()
            .map(|(id, entry)| {
                let snapshot = entry.monitor.snapshot();
                let (cycles_ok, cycles_failed) = entry.monitor.cycle_counts();
                RouterInfo {
                    router_id: id.clone(),
                    name: entry.name.clone(),
                    state: entry.monitor.state(),
                    sequence: snapshot.sequence,
                    refresh_interval_secs: entry.monitor.refresh_interval().as_secs(),
                    cycles_ok,
                    cycles_failed,
                    last_updated: snapshot.stats.last_updated,
                }
            })
            .collect()
    }

    /// Totaux (cycles publiés, cycles en échec) sur tous les routeurs
    pub fn cycle_totals(&self) -> (u64, u64) {
        self.routers
            .read()
            .values()
            .map(|e| e.monitor.cycle_counts())
            .fold((0, 0), |(ok, ko), (a, b)| (ok + a, ko + b))
    }

    pub fn shutdown_all(&self) {
        for (_, entry) in std::mem::take(&mut *self.routers.write()) {
            entry.monitor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::NullBaselineStore;
    use crate::models::MonitorEvent;
    use crate::upstream::RouterOsClient;
    use pppwatch_devkit::RouterFixture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn registry() -> MonitorRegistry {
        MonitorRegistry::new(Arc::new(RouterOsClient::new()), Arc::new(NullBaselineStore))
    }

    fn manual_settings(name: &str) -> RouterSettings {
        RouterSettings {
            name: name.into(),
            monitor: MonitorSettings {
                refresh_interval: Duration::ZERO,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_unknown_router_errors() {
        let reg = registry();
        assert!(matches!(reg.snapshot("nope"), Err(MonitorError::UnknownRouter(_))));
        assert!(matches!(reg.refresh_now("nope"), Err(MonitorError::UnknownRouter(_))));
        assert!(matches!(reg.detach("nope"), Err(MonitorError::UnknownRouter(_))));
    }

    #[tokio::test]
    async fn test_attach_list_detach() {
        let reg = registry();
        reg.attach("r1", manual_settings("Main"));
        reg.attach("r2", manual_settings("Backup"));

        let list = reg.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].router_id, "r1");
        assert_eq!(list[0].name, "Main");
        assert_eq!(list[0].sequence, 0);
        assert_eq!(list[0].refresh_interval_secs, 0);

        reg.set_refresh_interval("r2", 30).unwrap();
        assert_eq!(reg.list()[1].refresh_interval_secs, 30);

        reg.detach("r1").unwrap();
        assert_eq!(reg.router_ids(), vec!["r2".to_string()]);
    }

    #[tokio::test]
    async fn test_push_reaches_subscribers_of_every_router() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        reg.attach("r1", manual_settings("Main"));
        reg.subscribe_all(Arc::new(move |event: &MonitorEvent| {
            if let MonitorEvent::Published(s) = event {
                let _ = tx.send(s.clone());
            }
        }));
        // routeur attaché après l'abonnement global
        reg.attach("r2", manual_settings("Backup"));

        for id in ["r1", "r2"] {
            let fixture = RouterFixture::new()
                .interface("<pppoe-alice>", true, 10, 10)
                .account("alice", "10M")
                .raw_interface(serde_json::json!({"name": "broken"}));
            let payload: PushPayload = serde_json::from_value(fixture.push_payload(id, None)).unwrap();
            assert_eq!(reg.deliver_push(payload).unwrap(), 1);
        }

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by(|a, b| a.router_id.cmp(&b.router_id));
        assert_eq!(seen[0].router_id, "r1");
        assert_eq!(seen[1].router_id, "r2");
        assert_eq!(seen[1].stats.online_accounts, 1);
        assert_eq!(reg.snapshot("r2").unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_push_for_unknown_router_is_rejected() {
        let reg = registry();
        let payload: PushPayload =
            serde_json::from_value(RouterFixture::new().push_payload("ghost", None)).unwrap();
        assert!(matches!(reg.deliver_push(payload), Err(MonitorError::UnknownRouter(_))));
    }

    #[tokio::test]
    async fn test_fetch_failure_event_for_unregistered_endpoint() {
        // client sans endpoint : chaque fetch échoue en UnknownRouter côté amont
        let reg = registry();
        reg.attach("r1", manual_settings("Main"));

        let failures = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let counter = failures.clone();
        reg.subscribe(
            "r1",
            Arc::new(move |event: &MonitorEvent| {
                if matches!(event, MonitorEvent::FetchFailed { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(());
                }
            }),
        )
        .unwrap();

        reg.refresh_now("r1").unwrap();
        rx.recv().await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(reg.cycle_totals(), (0, 1));
        assert_eq!(reg.snapshot("r1").unwrap().sequence, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let reg = registry();
        reg.attach("r1", manual_settings("Main"));
        reg.shutdown_all();
        assert!(reg.is_empty());
    }
}
