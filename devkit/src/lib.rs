/*!
# pppwatch DevKit - Fixtures et stubs pour les tests du kernel

- Builders d'enregistrements au format RouterOS REST (interfaces, secrets, sessions)
- Payloads push prêts à publier
- Stub MQTT pour tester le bus sans broker
*/

pub mod fixtures;
pub mod mqtt_stub;

pub use fixtures::RouterFixture;
pub use mqtt_stub::{MockMqttClient, PppwatchTopics};
