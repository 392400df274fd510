/**
 * UPDATE SCHEDULER - Une tâche tokio par routeur, cycles strictement sérialisés
 *
 * RÔLE :
 * `RouterMonitor` est le contexte de supervision d'un routeur : il possède le
 * `Reconciler` (cache d'échantillons compris), le dernier snapshot publié et la
 * liste des callbacks abonnés.
 *
 * FONCTIONNEMENT :
 * - Déclencheurs : timer (désactivable avec un intervalle de 0), refresh manuel,
 *   push entrant. Tous attendus dans le même `select!` : jamais deux cycles à la fois
 * - Une seule place d'attente pendant un cycle : un poll (timer ou manuel) arrivant
 *   alors qu'un travail attend déjà est abandonné, un push remplace ce qui attend
 * - Timer/manuel : fetch des trois listes puis pipeline synchrone puis publication
 * - Push : le payload passe par le même pipeline, sans fetch ; les débits sont datés
 *   par `sampled_at`, `last_updated` par l'horloge du kernel
 * - Échec de fetch : cycle abandonné, snapshot précédent conservé, événement
 *   `FetchFailed` envoyé aux abonnés
 * - Changement d'intervalle : n'annule jamais un fetch en cours
 * - Arrêt : timer et push coupés tout de suite ; un fetch en vol termine mais son
 *   résultat est jeté (drapeau `alive`)
 * - Bases persistées : rechargées au démarrage de la tâche, sauvegardées après
 *   chaque publication
 *
 * États observables : Idle -> Fetching -> Publishing -> Idle, Stopped à l'arrêt.
 */

use crate::baseline::BaselineStore;
use crate::error::MonitorError;
use crate::models::{InterfaceKind, MonitorEvent, MonitorState, RawRecordSets, RouterId, Snapshot};
use crate::pipeline::Reconciler;
use crate::sampling::EvictionPolicy;
use crate::upstream::{fetch_all, RouterApi};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type SubscriptionId = u64;
pub type Callback = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(OffsetDateTime::now_utc)
}

#[derive(Clone)]
pub struct MonitorSettings {
    /// `Duration::ZERO` désactive le timer
    pub refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub monitored_kind: InterfaceKind,
    pub eviction: EvictionPolicy,
    pub clock: Clock,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(10),
            monitored_kind: InterfaceKind::PppoeIn,
            eviction: EvictionPolicy::Never,
            clock: system_clock(),
        }
    }
}

impl std::fmt::Debug for MonitorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSettings")
            .field("refresh_interval", &self.refresh_interval)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("monitored_kind", &self.monitored_kind)
            .field("eviction", &self.eviction)
            .finish_non_exhaustive()
    }
}

/// État partagé entre la poignée et la tâche de travail
struct MonitorShared {
    router_id: RouterId,
    snapshot: RwLock<Arc<Snapshot>>,
    state: Mutex<MonitorState>,
    alive: AtomicBool,
    subscribers: Mutex<HashMap<SubscriptionId, Callback>>,
    next_subscription: AtomicU64,
    cycles_ok: AtomicU64,
    cycles_failed: AtomicU64,
}

impl MonitorShared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn set_state(&self, state: MonitorState) {
        let mut current = self.state.lock();
        if *current != MonitorState::Stopped {
            *current = state;
        }
    }

    fn emit(&self, event: MonitorEvent) {
        // copie pour qu'un callback puisse se désabonner sans interblocage
        let callbacks: Vec<Callback> = self.subscribers.lock().values().cloned().collect();
        for cb in callbacks {
            cb(&event);
        }
    }
}

/// Travail en attente derrière le cycle en cours
enum Pending {
    Poll,
    Push(RawRecordSets, OffsetDateTime),
}

#[derive(Default)]
struct Triggers {
    wake: Notify,
    shutdown: Notify,
    pending: Mutex<Option<Pending>>,
}

impl Triggers {
    /// false si un travail attend déjà : la demande est abandonnée
    fn queue_poll(&self) -> bool {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return false;
        }
        *pending = Some(Pending::Poll);
        true
    }

    /// Retourne le travail remplacé, s'il y en avait un
    fn queue_push(&self, sets: RawRecordSets, sampled_at: OffsetDateTime) -> Option<Pending> {
        self.pending.lock().replace(Pending::Push(sets, sampled_at))
    }

    fn take(&self) -> Option<Pending> {
        self.pending.lock().take()
    }
}

pub struct RouterMonitor {
    shared: Arc<MonitorShared>,
    triggers: Arc<Triggers>,
    interval_tx: watch::Sender<Duration>,
    worker: JoinHandle<()>,
}

impl RouterMonitor {
    /// Crée le contexte du routeur et démarre sa tâche
    pub fn spawn(
        router_id: &str,
        api: Arc<dyn RouterApi>,
        store: Arc<dyn BaselineStore>,
        settings: MonitorSettings,
    ) -> Self {
        Self::spawn_with_subscribers(router_id, api, store, settings, Vec::new())
    }

    /// Les abonnés passés ici sont inscrits avant le premier cycle
    pub fn spawn_with_subscribers(
        router_id: &str,
        api: Arc<dyn RouterApi>,
        store: Arc<dyn BaselineStore>,
        settings: MonitorSettings,
        subscribers: Vec<Callback>,
    ) -> Self {
        let now = (settings.clock)();
        let next_subscription = subscribers.len() as u64 + 1;
        let subscribers: HashMap<SubscriptionId, Callback> =
            (1..).zip(subscribers).collect();
        let shared = Arc::new(MonitorShared {
            router_id: router_id.to_string(),
            snapshot: RwLock::new(Arc::new(Snapshot::empty(router_id, now))),
            state: Mutex::new(MonitorState::Idle),
            alive: AtomicBool::new(true),
            subscribers: Mutex::new(subscribers),
            next_subscription: AtomicU64::new(next_subscription),
            cycles_ok: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
        });
        let triggers = Arc::new(Triggers::default());
        let (interval_tx, interval_rx) = watch::channel(settings.refresh_interval);

        let reconciler = Reconciler::new(settings.monitored_kind, settings.eviction);

        let worker = Worker {
            shared: shared.clone(),
            triggers: triggers.clone(),
            api,
            store,
            reconciler,
            fetch_timeout: settings.fetch_timeout,
            clock: settings.clock,
        };
        let worker = tokio::spawn(worker.run(interval_rx));
        info!(router = router_id, interval_secs = settings.refresh_interval.as_secs(), "router monitor started");

        Self {
            shared,
            triggers,
            interval_tx,
            worker,
        }
    }

    pub fn router_id(&self) -> &str {
        &self.shared.router_id
    }

    /// Dernier snapshot publié, sans attente
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.snapshot.read().clone()
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.lock()
    }

    pub fn refresh_interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// (cycles publiés, cycles en échec)
    pub fn cycle_counts(&self) -> (u64, u64) {
        (
            self.shared.cycles_ok.load(Ordering::Relaxed),
            self.shared.cycles_failed.load(Ordering::Relaxed),
        )
    }

    fn ensure_alive(&self) -> Result<(), MonitorError> {
        if self.shared.is_alive() {
            Ok(())
        } else {
            Err(MonitorError::Stopped(self.shared.router_id.clone()))
        }
    }

    pub fn set_refresh_interval(&self, interval: Duration) -> Result<(), MonitorError> {
        self.ensure_alive()?;
        self.interval_tx.send_replace(interval);
        info!(router = %self.shared.router_id, interval_secs = interval.as_secs(), "refresh interval changed");
        Ok(())
    }

    pub fn refresh_now(&self) -> Result<(), MonitorError> {
        self.ensure_alive()?;
        if self.triggers.queue_poll() {
            self.triggers.wake.notify_one();
        } else {
            debug!(router = %self.shared.router_id, "refresh dropped, a cycle is already pending");
        }
        Ok(())
    }

    pub fn deliver_push(&self, sets: RawRecordSets, sampled_at: OffsetDateTime) -> Result<(), MonitorError> {
        self.ensure_alive()?;
        match self.triggers.queue_push(sets, sampled_at) {
            Some(Pending::Push(..)) => debug!(router = %self.shared.router_id, "pending push superseded"),
            Some(Pending::Poll) => debug!(router = %self.shared.router_id, "pending poll replaced by push"),
            None => {}
        }
        self.triggers.wake.notify_one();
        Ok(())
    }

    pub fn subscribe(&self, callback: Callback) -> SubscriptionId {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers.lock().insert(id, callback);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.subscribers.lock().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Arrêt : plus aucun déclencheur, abonnés libérés, fetch en vol ignoré
    pub fn shutdown(&self) {
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.shared.state.lock() = MonitorState::Stopped;
        self.shared.subscribers.lock().clear();
        self.triggers.take();
        self.triggers.shutdown.notify_one();
        info!(router = %self.shared.router_id, "router monitor stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

impl Drop for RouterMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    shared: Arc<MonitorShared>,
    triggers: Arc<Triggers>,
    api: Arc<dyn RouterApi>,
    store: Arc<dyn BaselineStore>,
    reconciler: Reconciler,
    fetch_timeout: Duration,
    clock: Clock,
}

/// Échéance du timer. Un tick échu pendant un cycle n'est rattrapé qu'une fois.
struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    /// Premier tick immédiat au démarrage, décalé d'une période après un changement
    fn new(period: Duration, immediate: bool) -> Option<Self> {
        if period.is_zero() {
            return None;
        }
        let now = Instant::now();
        Some(Self {
            period,
            next: if immediate { now } else { now + period },
        })
    }

    /// Consomme le tick s'il est échu ; le suivant est une période plus tard
    fn take_due(&mut self) -> bool {
        let now = Instant::now();
        if now < self.next {
            return false;
        }
        self.next = now + self.period;
        true
    }
}

async fn wait_tick(ticker: Option<&Ticker>) {
    match ticker {
        Some(t) => tokio::time::sleep_until(t.next).await,
        None => std::future::pending::<()>().await,
    }
}

impl Worker {
    async fn run(mut self, mut interval_rx: watch::Receiver<Duration>) {
        match self.store.load(&self.shared.router_id).await {
            Ok(entries) => self.reconciler.restore_baselines(entries),
            Err(e) => warn!(router = %self.shared.router_id, error = %e, "failed to load baselines, starting empty"),
        }

        let mut ticker = Ticker::new(*interval_rx.borrow_and_update(), true);

        loop {
            tokio::select! {
                biased;
                _ = self.triggers.shutdown.notified() => break,
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    ticker = Ticker::new(*interval_rx.borrow_and_update(), false);
                    continue;
                }
                _ = self.triggers.wake.notified() => {}
                _ = wait_tick(ticker.as_ref()) => {}
            }

            if !self.shared.is_alive() {
                break;
            }

            // un tick échu pendant le cycle précédent passe par la même place d'attente
            if ticker.as_mut().is_some_and(|t| t.take_due()) && !self.triggers.queue_poll() {
                debug!(router = %self.shared.router_id, "timer tick dropped, a cycle is already pending");
            }

            match self.triggers.take() {
                Some(Pending::Poll) => self.poll_cycle().await,
                Some(Pending::Push(sets, sampled_at)) => {
                    debug!(router = %self.shared.router_id, "push cycle");
                    self.publish(&sets, sampled_at).await;
                }
                None => {}
            }
        }

        self.shared.set_state(MonitorState::Stopped);
        debug!(router = %self.shared.router_id, "monitor worker exited");
    }

    async fn poll_cycle(&mut self) {
        let router_id = self.shared.router_id.clone();
        self.shared.set_state(MonitorState::Fetching);

        let result = fetch_all(self.api.as_ref(), &router_id, self.fetch_timeout).await;

        if !self.shared.is_alive() {
            debug!(router = %router_id, "monitor torn down during fetch, result discarded");
            return;
        }

        match result {
            Ok(sets) => {
                let now = (self.clock)();
                self.publish(&sets, now).await;
            }
            Err(e) => {
                self.shared.cycles_failed.fetch_add(1, Ordering::Relaxed);
                self.shared.set_state(MonitorState::Idle);
                warn!(router = %router_id, error = %e, "upstream fetch failed, keeping previous snapshot");
                self.shared.emit(MonitorEvent::FetchFailed {
                    router_id,
                    error: e.to_string(),
                    at: (self.clock)(),
                });
            }
        }
    }

    async fn publish(&mut self, sets: &RawRecordSets, sampled_at: OffsetDateTime) {
        self.shared.set_state(MonitorState::Publishing);
        let output = self.reconciler.run_sampled(sets, sampled_at, (self.clock)());

        let sequence = self.shared.snapshot.read().sequence + 1;
        let snapshot = Arc::new(Snapshot {
            router_id: self.shared.router_id.clone(),
            sequence,
            rows: output.rows,
            stats: output.stats,
        });
        *self.shared.snapshot.write() = snapshot.clone();
        self.shared.cycles_ok.fetch_add(1, Ordering::Relaxed);

        let baselines = self.reconciler.baselines();
        if let Err(e) = self.store.save(&self.shared.router_id, &baselines).await {
            warn!(router = %self.shared.router_id, error = %e, "failed to persist baselines");
        }

        debug!(
            router = %self.shared.router_id,
            sequence,
            rows = snapshot.rows.len(),
            online = snapshot.stats.online_accounts,
            "snapshot published"
        );
        self.shared.set_state(MonitorState::Idle);
        self.shared.emit(MonitorEvent::Published(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{JsonBaselineStore, NullBaselineStore};
    use crate::error::FetchError;
    use crate::ingest::{ingest_accounts, ingest_interfaces, ingest_sessions, PushPayload};
    use crate::models::{AccountRecord, ActiveSession, RawInterfaceSample, SubscriberStatus};
    use async_trait::async_trait;
    use pppwatch_devkit::RouterFixture;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use time::macros::datetime;
    use tokio::sync::mpsc;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00:00 UTC);

    /// Routeur simulé : sert un fixture RouterOS, peut échouer ou bloquer le fetch
    #[derive(Default)]
    struct MockRouter {
        fixture: Mutex<RouterFixture>,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
        calls: AtomicUsize,
    }

    impl MockRouter {
        fn serving(fixture: RouterFixture) -> Self {
            Self {
                fixture: Mutex::new(fixture),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RouterApi for MockRouter {
        async fn list_interfaces(&self, router_id: &str) -> Result<Vec<RawInterfaceSample>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(FetchError::Status {
                    endpoint: "interface".into(),
                    status: 503,
                });
            }
            let values = self.fixture.lock().interfaces_json();
            Ok(ingest_interfaces(router_id, &values).records)
        }

        async fn list_accounts(&self, router_id: &str) -> Result<Vec<AccountRecord>, FetchError> {
            let values = self.fixture.lock().accounts_json();
            Ok(ingest_accounts(router_id, &values).records)
        }

        async fn list_active_sessions(&self, router_id: &str) -> Result<Vec<ActiveSession>, FetchError> {
            let values = self.fixture.lock().sessions_json();
            Ok(ingest_sessions(router_id, &values, T0).records)
        }
    }

    /// Horloge de test avançable à la main
    fn manual_clock() -> (Clock, Arc<Mutex<OffsetDateTime>>) {
        let now = Arc::new(Mutex::new(T0));
        let handle = now.clone();
        (Arc::new(move || *handle.lock()), now)
    }

    fn settings(interval_secs: u64, clock: Clock) -> MonitorSettings {
        MonitorSettings {
            refresh_interval: Duration::from_secs(interval_secs),
            fetch_timeout: Duration::from_secs(10),
            monitored_kind: InterfaceKind::PppoeIn,
            eviction: EvictionPolicy::Never,
            clock,
        }
    }

    fn events(monitor: &RouterMonitor) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        monitor.subscribe(Arc::new(move |event: &MonitorEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    async fn next_published(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Arc<Snapshot> {
        loop {
            match rx.recv().await {
                Some(MonitorEvent::Published(snapshot)) => return snapshot,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    fn record_sets(fixture: &RouterFixture, at: OffsetDateTime) -> RawRecordSets {
        let payload: PushPayload = serde_json::from_value(fixture.push_payload("r1", None)).unwrap();
        payload.into_record_sets(at).0
    }

    fn gated(gate: &Arc<Notify>, fixture: RouterFixture) -> Arc<MockRouter> {
        Arc::new(MockRouter {
            fixture: Mutex::new(fixture),
            gate: Some(gate.clone()),
            ..Default::default()
        })
    }

    fn alice_fixture(rx: u64, tx: u64) -> RouterFixture {
        RouterFixture::new()
            .interface("<pppoe-alice>", true, rx, tx)
            .account("alice", "10M")
            .disabled_account("bob")
            .session("alice", "10.0.0.2", "1h")
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_disabled_but_refresh_now_publishes() {
        let (clock, _) = manual_clock();
        let api = Arc::new(MockRouter::serving(alice_fixture(0, 0)));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.snapshot().sequence, 0);

        monitor.refresh_now().unwrap();
        let snapshot = next_published(&mut rx).await;
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(snapshot.stats.total_accounts, 2);
        assert_eq!(snapshot.stats.disabled_accounts, 1);
        assert_eq!(monitor.snapshot().sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_and_interval_change() {
        let (clock, _) = manual_clock();
        let api = Arc::new(MockRouter::serving(alice_fixture(0, 0)));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(5, clock));
        let mut rx = events(&monitor);

        // premier tick immédiat puis un toutes les 5s
        next_published(&mut rx).await;
        next_published(&mut rx).await;
        assert_eq!(monitor.snapshot().sequence, 2);

        monitor.set_refresh_interval(Duration::ZERO).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let calls = api.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), calls);
        assert_eq!(monitor.refresh_interval(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rates_across_poll_cycles() {
        let (clock, now) = manual_clock();
        let api = Arc::new(MockRouter::serving(alice_fixture(1_000_000, 500_000)));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        monitor.refresh_now().unwrap();
        next_published(&mut rx).await;

        *api.fixture.lock() = alice_fixture(2_000_000, 600_000);
        *now.lock() = T0 + time::Duration::seconds(8);
        monitor.refresh_now().unwrap();
        let snapshot = next_published(&mut rx).await;

        let alice = snapshot.row("alice").unwrap();
        assert_eq!(alice.status, SubscriberStatus::Online);
        assert!((alice.download_rate - 1.0).abs() < 1e-9);
        assert!((alice.upload_rate - 0.1).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_previous_snapshot() {
        let (clock, _) = manual_clock();
        let api = Arc::new(MockRouter::serving(alice_fixture(0, 0)));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        monitor.refresh_now().unwrap();
        let published = next_published(&mut rx).await;

        api.fail.store(true, Ordering::SeqCst);
        monitor.refresh_now().unwrap();
        match rx.recv().await {
            Some(MonitorEvent::FetchFailed { router_id, error, .. }) => {
                assert_eq!(router_id, "r1");
                assert!(error.contains("503"));
            }
            other => panic!("expected FetchFailed, got {other:?}"),
        }

        assert!(Arc::ptr_eq(&monitor.snapshot(), &published));
        assert_eq!(monitor.cycle_counts(), (1, 1));
        assert_eq!(monitor.state(), MonitorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_discards_in_flight_fetch() {
        let (clock, _) = manual_clock();
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockRouter {
            fixture: Mutex::new(alice_fixture(0, 0)),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));

        monitor.refresh_now().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.state(), MonitorState::Fetching);

        monitor.shutdown();
        assert!(monitor.refresh_now().is_err());
        assert_eq!(monitor.subscriber_count(), 0);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(monitor.snapshot().sequence, 0);
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(monitor.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_does_not_cancel_fetch() {
        let (clock, _) = manual_clock();
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockRouter {
            fixture: Mutex::new(alice_fixture(0, 0)),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        monitor.refresh_now().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        monitor.set_refresh_interval(Duration::from_secs(30)).unwrap();
        gate.notify_one();

        let snapshot = next_published(&mut rx).await;
        assert_eq!(snapshot.sequence, 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_triggers_coalesce() {
        let (clock, _) = manual_clock();
        let gate = Arc::new(Notify::new());
        let api = Arc::new(MockRouter {
            fixture: Mutex::new(alice_fixture(0, 0)),
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        monitor.refresh_now().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            monitor.refresh_now().unwrap();
        }
        gate.notify_one();
        next_published(&mut rx).await;

        // un seul cycle en attente malgré cinq demandes
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.notify_one();
        next_published(&mut rx).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
        assert_eq!(monitor.snapshot().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_and_poll_converge() {
        let (poll_clock, poll_now) = manual_clock();
        let (push_clock, push_now) = manual_clock();
        let api = Arc::new(MockRouter::serving(alice_fixture(1_000_000, 500_000)));
        let polled = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, poll_clock));
        let pushed = RouterMonitor::spawn(
            "r1",
            Arc::new(MockRouter::default()),
            Arc::new(NullBaselineStore),
            settings(0, push_clock),
        );
        let mut poll_rx = events(&polled);
        let mut push_rx = events(&pushed);

        for (step, fixture) in [(0, alice_fixture(1_000_000, 500_000)), (8, alice_fixture(2_000_000, 600_000))] {
            let at = T0 + time::Duration::seconds(step);
            *api.fixture.lock() = fixture.clone();
            *poll_now.lock() = at;
            *push_now.lock() = at;
            polled.refresh_now().unwrap();

            let stamp = at.format(&time::format_description::well_known::Rfc3339).unwrap();
            let payload: PushPayload = serde_json::from_value(fixture.push_payload("r1", Some(&stamp))).unwrap();
            let (sets, rejected) = payload.into_record_sets(at);
            assert_eq!(rejected, 0);
            pushed.deliver_push(sets, at).unwrap();

            let a = next_published(&mut poll_rx).await;
            let b = next_published(&mut push_rx).await;
            assert_eq!(a.rows, b.rows);
            assert_eq!(a.stats, b.stats);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_manual_and_push_share_one_pending_slot() {
        let (clock, _) = manual_clock();
        let gate = Arc::new(Notify::new());
        let api = gated(&gate, alice_fixture(0, 0));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(5, clock));
        let mut rx = events(&monitor);

        // premier tick immédiat : fetch bloqué
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.state(), MonitorState::Fetching);

        monitor.refresh_now().unwrap();
        // le tick de 5s échoit pendant le fetch
        tokio::time::sleep(Duration::from_secs(6)).await;
        let pushed = RouterFixture::new().interface("<pppoe-alice>", true, 0, 0).account("alice", "20M");
        monitor.deliver_push(record_sets(&pushed, T0), T0).unwrap();

        gate.notify_one();
        let polled = next_published(&mut rx).await;
        assert_eq!(polled.row("alice").unwrap().profile, "10M");
        let from_push = next_published(&mut rx).await;
        assert_eq!(from_push.sequence, 2);
        assert_eq!(from_push.row("alice").unwrap().profile, "20M");

        // ni le refresh ni le tick échu ne relancent de fetch
        gate.notify_one();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.snapshot().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_push_replaces_pending_push() {
        let (clock, _) = manual_clock();
        let gate = Arc::new(Notify::new());
        let api = gated(&gate, alice_fixture(0, 0));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        monitor.refresh_now().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let older = RouterFixture::new().account("alice", "5M");
        let newer = RouterFixture::new().account("alice", "50M");
        monitor.deliver_push(record_sets(&older, T0), T0).unwrap();
        monitor.deliver_push(record_sets(&newer, T0), T0).unwrap();

        gate.notify_one();
        next_published(&mut rx).await;
        let snapshot = next_published(&mut rx).await;
        assert_eq!(snapshot.row("alice").unwrap().profile, "50M");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.snapshot().sequence, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_rates_follow_sample_time_and_stats_follow_clock() {
        let (clock, now) = manual_clock();
        let wall = T0 + time::Duration::minutes(5);
        *now.lock() = wall;
        let monitor = RouterMonitor::spawn(
            "r1",
            Arc::new(MockRouter::default()),
            Arc::new(NullBaselineStore),
            settings(0, clock),
        );
        let mut rx = events(&monitor);

        let sampled = T0 + time::Duration::seconds(8);
        monitor.deliver_push(record_sets(&alice_fixture(1_000_000, 0), T0), T0).unwrap();
        next_published(&mut rx).await;
        monitor.deliver_push(record_sets(&alice_fixture(2_000_000, 0), sampled), sampled).unwrap();
        let snapshot = next_published(&mut rx).await;

        assert!((snapshot.row("alice").unwrap().download_rate - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.stats.last_updated, wall);
    }

    #[tokio::test(start_paused = true)]
    async fn test_downtime_from_logout_and_presence() {
        let (clock, now) = manual_clock();
        let api = Arc::new(MockRouter::serving(
            alice_fixture(0, 0).logged_out_account("carol", "5M", "2024-05-01T11:00:00Z"),
        ));
        let monitor = RouterMonitor::spawn("r1", api.clone(), Arc::new(NullBaselineStore), settings(0, clock));
        let mut rx = events(&monitor);

        monitor.refresh_now().unwrap();
        let first = next_published(&mut rx).await;
        let carol = first.row("carol").unwrap();
        assert_eq!(carol.status, SubscriberStatus::Offline);
        assert_eq!(carol.downtime_seconds, Some(3_600));
        assert_eq!(first.row("alice").unwrap().downtime_seconds, None);

        // alice se déconnecte : interface down, plus de session
        *api.fixture.lock() = RouterFixture::new()
            .interface("<pppoe-alice>", false, 0, 0)
            .account("alice", "10M");
        *now.lock() = T0 + time::Duration::seconds(120);
        monitor.refresh_now().unwrap();
        let second = next_published(&mut rx).await;

        let alice = second.row("alice").unwrap();
        assert_eq!(alice.status, SubscriberStatus::Offline);
        assert_eq!(alice.downtime_seconds, Some(120));
        assert_eq!(alice.last_uptime, Some(Duration::from_secs(3_600)));
    }

    #[tokio::test]
    async fn test_baselines_persisted_across_monitor_restart() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(JsonBaselineStore::new(temp.path()).unwrap());

        let (clock, _) = manual_clock();
        let api = Arc::new(MockRouter::serving(alice_fixture(1_000_000, 0)));
        let first = RouterMonitor::spawn("r1", api, store.clone(), settings(0, clock));
        let mut rx = events(&first);
        first.refresh_now().unwrap();
        next_published(&mut rx).await;
        first.shutdown();

        let (clock, now) = manual_clock();
        *now.lock() = T0 + time::Duration::seconds(8);
        let api = Arc::new(MockRouter::serving(alice_fixture(2_000_000, 0)));
        let restarted = RouterMonitor::spawn("r1", api, store, settings(0, clock));
        let mut rx = events(&restarted);
        restarted.refresh_now().unwrap();
        let snapshot = next_published(&mut rx).await;

        assert_eq!(snapshot.sequence, 1);
        assert!((snapshot.row("alice").unwrap().download_rate - 1.0).abs() < 1e-9);
    }
}
