/**
 * BUS MQTT PPPWATCH - Push entrant et republication des snapshots
 *
 * TOPICS :
 * - pppwatch/routers/{id}/push@v1   (entrant)  listes brutes poussées par un collecteur
 * - pppwatch/routers/{id}/stats@v1  (sortant)  stats après chaque publication
 * - pppwatch/routers/{id}/error@v1  (sortant)  échec de fetch amont
 * - pppwatch/kernel/health@v1       (sortant)  voir health.rs
 *
 * Le push ne court-circuite rien : le payload est ingéré puis passe par le même
 * pipeline que le polling, dans la tâche du routeur concerné.
 */

use crate::config::MqttConf;
use crate::error::{BusError, PushError};
use crate::health::HealthTracker;
use crate::ingest::PushPayload;
use crate::models::MonitorEvent;
use crate::registry::SharedRegistry;
use crate::views::StatsView;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub const PUSH_FILTER: &str = "pppwatch/routers/+/push@v1";
pub const HEALTH_TOPIC: &str = "pppwatch/kernel/health@v1";

pub fn stats_topic(router_id: &str) -> String {
    format!("pppwatch/routers/{router_id}/stats@v1")
}

pub fn error_topic(router_id: &str) -> String {
    format!("pppwatch/routers/{router_id}/error@v1")
}

/// `pppwatch/routers/{id}/push@v1` -> `{id}`
pub fn router_from_push_topic(topic: &str) -> Option<&str> {
    let id = topic.strip_prefix("pppwatch/routers/")?.strip_suffix("/push@v1")?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Sortie vers le bus ; implémentée par le client rumqttc et par les stubs de test
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
impl BusPublisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let client_id = format!("pppwatch-kernel-{}", uuid::Uuid::new_v4().simple());
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    opts.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);
    AsyncClient::new(opts, 64)
}

/// Traite un message push ; retourne le nombre d'enregistrements rejetés à l'ingestion
pub fn handle_push(registry: &SharedRegistry, topic: &str, payload: &[u8]) -> Result<usize, PushError> {
    let topic_router = router_from_push_topic(topic).ok_or_else(|| PushError::Topic(topic.to_string()))?;
    let push: PushPayload = serde_json::from_slice(payload)?;
    if push.router_id != topic_router {
        return Err(PushError::RouterMismatch {
            topic: topic_router.to_string(),
            payload: push.router_id,
        });
    }
    Ok(registry.deliver_push(push)?)
}

/// Boucle MQTT entrante : (ré)abonnement à chaque ConnAck, push routés vers le registre
pub fn spawn_mqtt_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    registry: SharedRegistry,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    if let Err(e) = client.subscribe(PUSH_FILTER, QoS::AtLeastOnce).await {
                        error!(error = ?e, "MQTT subscribe failed");
                    } else {
                        info!(filter = PUSH_FILTER, "subscribed to push topic");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => match handle_push(&registry, &p.topic, &p.payload) {
                    Ok(0) => debug!(topic = %p.topic, "push delivered"),
                    Ok(rejected) => warn!(topic = %p.topic, rejected, "push delivered with rejected records"),
                    Err(e) => warn!(topic = %p.topic, error = %e, "push ignored"),
                },
                Ok(_) => {}
                Err(e) => {
                    warn!(error = ?e, "MQTT connection error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

#[derive(Debug, Serialize)]
struct StatsMessage {
    router_id: String,
    sequence: u64,
    stats: StatsView,
}

#[derive(Debug, Serialize)]
struct ErrorMessage<'a> {
    router_id: &'a str,
    error: &'a str,
    at: String,
}

/// Topic et corps JSON correspondant à un événement de contexte
pub fn event_message(event: &MonitorEvent) -> Result<(String, Vec<u8>), serde_json::Error> {
    match event {
        MonitorEvent::Published(snapshot) => {
            let body = StatsMessage {
                router_id: snapshot.router_id.clone(),
                sequence: snapshot.sequence,
                stats: StatsView::from(&snapshot.stats),
            };
            Ok((stats_topic(&snapshot.router_id), serde_json::to_vec(&body)?))
        }
        MonitorEvent::FetchFailed { router_id, error, at } => {
            let body = ErrorMessage {
                router_id,
                error,
                at: at.format(&Rfc3339).unwrap_or_default(),
            };
            Ok((error_topic(router_id), serde_json::to_vec(&body)?))
        }
    }
}

/// Abonne le bus à tous les routeurs : chaque événement est republié en MQTT.
/// Les callbacks étant synchrones, ils ne font que pousser dans un channel.
pub fn spawn_republisher(registry: &SharedRegistry, publisher: Arc<dyn BusPublisher>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<MonitorEvent>();
    registry.subscribe_all(Arc::new(move |event: &MonitorEvent| {
        let _ = tx.send(event.clone());
    }));

    task::spawn(async move {
        while let Some(event) = rx.recv().await {
            let (topic, body) = match event_message(&event) {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "failed to serialize monitor event");
                    continue;
                }
            };
            if let Err(e) = publisher.publish(&topic, body).await {
                warn!(error = %e, "republish failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::NullBaselineStore;
    use crate::registry::{MonitorRegistry, RouterSettings};
    use crate::scheduler::MonitorSettings;
    use crate::upstream::RouterOsClient;
    use pppwatch_devkit::{MockMqttClient, PppwatchTopics, RouterFixture};
    use serde_json::Value;

    #[async_trait]
    impl BusPublisher for MockMqttClient {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            MockMqttClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
                .await
                .map_err(|e| BusError {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
        }
    }

    fn registry_with(router_id: &str) -> SharedRegistry {
        let registry = Arc::new(MonitorRegistry::new(
            Arc::new(RouterOsClient::new()),
            Arc::new(NullBaselineStore),
        ));
        registry.attach(
            router_id,
            RouterSettings {
                name: router_id.into(),
                monitor: MonitorSettings {
                    refresh_interval: Duration::ZERO,
                    ..Default::default()
                },
            },
        );
        registry
    }

    async fn wait_for_message(mock: &MockMqttClient, topic: &str) -> Value {
        for _ in 0..200 {
            if let Some(v) = mock.get_last_json_message::<Value>(topic).unwrap() {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no message on {topic}");
    }

    #[test]
    fn test_router_from_push_topic() {
        assert_eq!(router_from_push_topic("pppwatch/routers/router_001/push@v1"), Some("router_001"));
        assert_eq!(router_from_push_topic("pppwatch/routers//push@v1"), None);
        assert_eq!(router_from_push_topic("pppwatch/routers/a/b/push@v1"), None);
        assert_eq!(router_from_push_topic("pppwatch/routers/r1/stats@v1"), None);
        assert_eq!(stats_topic("r1"), PppwatchTopics::stats("r1"));
        assert_eq!(error_topic("r1"), PppwatchTopics::error("r1"));
        assert_eq!(PUSH_FILTER, PppwatchTopics::PUSH_FILTER);
        assert_eq!(HEALTH_TOPIC, PppwatchTopics::HEALTH);
    }

    #[tokio::test]
    async fn test_push_over_bus_is_republished_as_stats() {
        let registry = registry_with("r1");
        let bus = MockMqttClient::new();
        let mut incoming = bus.setup_receiver();
        bus.subscribe(PUSH_FILTER, QoS::AtLeastOnce).await.unwrap();
        spawn_republisher(&registry, Arc::new(bus.clone()));

        let fixture = RouterFixture::new()
            .interface("<pppoe-alice>", true, 100, 100)
            .account("alice", "10M")
            .disabled_account("bob");
        let body = serde_json::to_vec(&fixture.push_payload_now("r1")).unwrap();
        assert!(bus.simulate_incoming(PppwatchTopics::push("r1"), body).await.unwrap());

        let msg = incoming.recv().await.unwrap();
        assert_eq!(handle_push(&registry, &msg.topic, &msg.payload).unwrap(), 0);

        let stats = wait_for_message(&bus, &stats_topic("r1")).await;
        assert_eq!(stats["router_id"], "r1");
        assert_eq!(stats["sequence"], 1);
        assert_eq!(stats["stats"]["total_accounts"], 2);
        assert_eq!(stats["stats"]["online_accounts"], 1);
        assert_eq!(stats["stats"]["disabled_accounts"], 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_republished_as_error() {
        // aucun endpoint enregistré : le fetch échoue
        let registry = registry_with("r1");
        let bus = MockMqttClient::new();
        spawn_republisher(&registry, Arc::new(bus.clone()));

        registry.refresh_now("r1").unwrap();
        let err = wait_for_message(&bus, &error_topic("r1")).await;
        assert_eq!(err["router_id"], "r1");
        assert!(err["error"].as_str().unwrap().contains("r1"));
    }

    #[tokio::test]
    async fn test_republisher_wired_before_attach_sees_first_cycle() {
        let registry: SharedRegistry = Arc::new(MonitorRegistry::new(
            Arc::new(RouterOsClient::new()),
            Arc::new(NullBaselineStore),
        ));
        let bus = MockMqttClient::new();
        spawn_republisher(&registry, Arc::new(bus.clone()));

        // timer actif : premier cycle immédiat, sans refresh manuel
        registry.attach(
            "r1",
            RouterSettings {
                name: "r1".into(),
                monitor: MonitorSettings::default(),
            },
        );
        let err = wait_for_message(&bus, &error_topic("r1")).await;
        assert_eq!(err["router_id"], "r1");
        registry.shutdown_all();
    }

    #[tokio::test]
    async fn test_push_rejections() {
        let registry = registry_with("r1");
        let topic = PppwatchTopics::push("r1");

        let mismatch = serde_json::to_vec(&PppwatchTopics::empty_push("r2")).unwrap();
        assert!(matches!(
            handle_push(&registry, &topic, &mismatch),
            Err(PushError::RouterMismatch { .. })
        ));
        assert!(matches!(handle_push(&registry, &topic, b"{oops"), Err(PushError::Json(_))));
        assert!(matches!(
            handle_push(&registry, "pppwatch/kernel/health@v1", b"{}"),
            Err(PushError::Topic(_))
        ));

        let unknown = serde_json::to_vec(&PppwatchTopics::empty_push("ghost")).unwrap();
        assert!(matches!(
            handle_push(&registry, &PppwatchTopics::push("ghost"), &unknown),
            Err(PushError::Monitor(_))
        ));
    }
}
