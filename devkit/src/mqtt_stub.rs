/*!
Mock MQTT Client pour tester le bus pppwatch sans broker

Enregistre tous les messages publiés et permet d'injecter des messages entrants
(payloads push) via un channel, comme le ferait l'eventloop rumqttc.
*/

use anyhow::Result;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Correspondance de topic MQTT avec jokers `+` et `#`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Mock qui imite l'API de `rumqttc::AsyncClient`
#[derive(Clone, Default)]
pub struct MockMqttClient {
    published: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel des messages simulés (équivalent de l'eventloop)
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.incoming.lock().unwrap() = Some(sender);
        receiver
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        };
        log::info!("[mock] published to {}: {} bytes", message.topic, message.payload.len());
        self.published.lock().unwrap().push(message);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("[mock] subscribed to {}", topic);
        self.subscriptions.lock().unwrap().push(topic);
        Ok(())
    }

    /// Injecte un message entrant ; ignoré si aucun abonnement ne couvre le topic
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<bool>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        let subscribed = self
            .subscriptions
            .lock()
            .unwrap()
            .iter()
            .any(|filter| topic_matches(filter, &message.topic));
        if !subscribed {
            log::warn!("[mock] no subscription for {}, message dropped", message.topic);
            return Ok(false);
        }

        if let Some(sender) = self.incoming.lock().unwrap().as_ref() {
            sender
                .send(message)
                .map_err(|e| anyhow::anyhow!("send error: {}", e))?;
        }
        Ok(true)
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }
}

/// Topics du bus pppwatch
pub struct PppwatchTopics;

impl PppwatchTopics {
    pub const PUSH_FILTER: &'static str = "pppwatch/routers/+/push@v1";
    pub const HEALTH: &'static str = "pppwatch/kernel/health@v1";

    pub fn push(router_id: &str) -> String {
        format!("pppwatch/routers/{router_id}/push@v1")
    }

    pub fn stats(router_id: &str) -> String {
        format!("pppwatch/routers/{router_id}/stats@v1")
    }

    pub fn error(router_id: &str) -> String {
        format!("pppwatch/routers/{router_id}/error@v1")
    }

    /// Corps JSON vide mais valide pour un push, utile aux tests de routage
    pub fn empty_push(router_id: &str) -> Value {
        serde_json::json!({ "router_id": router_id })
    }
}
