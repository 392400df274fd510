/*!
Fixtures RouterOS

Construit les trois listes telles que l'API REST RouterOS les renvoie
(valeurs en chaînes, clés en kebab-case), et les payloads push équivalents.
*/

use serde_json::{json, Value};

/// État simulé d'un routeur, à servir par un faux client ou à pousser sur le bus
#[derive(Debug, Clone, Default)]
pub struct RouterFixture {
    interfaces: Vec<Value>,
    accounts: Vec<Value>,
    sessions: Vec<Value>,
}

impl RouterFixture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interface pppoe-in, compteurs en chaînes comme RouterOS
    pub fn interface(mut self, name: &str, running: bool, rx_bytes: u64, tx_bytes: u64) -> Self {
        self.interfaces.push(json!({
            "name": name,
            "type": "pppoe-in",
            "running": running.to_string(),
            "rx-byte": rx_bytes.to_string(),
            "tx-byte": tx_bytes.to_string(),
        }));
        self
    }

    /// Interface d'un autre type (ignorée par le kernel)
    pub fn ethernet(mut self, name: &str, rx_bytes: u64, tx_bytes: u64) -> Self {
        self.interfaces.push(json!({
            "name": name,
            "type": "ether",
            "running": "true",
            "rx-byte": rx_bytes.to_string(),
            "tx-byte": tx_bytes.to_string(),
        }));
        self
    }

    pub fn account(mut self, name: &str, profile: &str) -> Self {
        self.accounts.push(json!({
            "name": name,
            "profile": profile,
            "disabled": "false",
        }));
        self
    }

    pub fn disabled_account(mut self, name: &str) -> Self {
        self.accounts.push(json!({
            "name": name,
            "profile": "default",
            "disabled": "true",
        }));
        self
    }

    /// Compte déconnecté depuis `last_logged_out` (RFC3339)
    pub fn logged_out_account(mut self, name: &str, profile: &str, last_logged_out: &str) -> Self {
        self.accounts.push(json!({
            "name": name,
            "profile": profile,
            "disabled": "false",
            "last-logged-out": last_logged_out,
        }));
        self
    }

    /// `uptime` au format RouterOS, ex. "1d2h3m"
    pub fn session(mut self, name: &str, address: &str, uptime: &str) -> Self {
        self.sessions.push(json!({
            "name": name,
            "service": "pppoe",
            "address": address,
            "uptime": uptime,
        }));
        self
    }

    /// Enregistrement libre, pour tester les rejets à l'ingestion
    pub fn raw_interface(mut self, value: Value) -> Self {
        self.interfaces.push(value);
        self
    }

    pub fn interfaces_json(&self) -> Vec<Value> {
        self.interfaces.clone()
    }

    pub fn accounts_json(&self) -> Vec<Value> {
        self.accounts.clone()
    }

    pub fn sessions_json(&self) -> Vec<Value> {
        self.sessions.clone()
    }

    /// Payload `pppwatch/routers/{id}/push@v1`
    pub fn push_payload(&self, router_id: &str, sampled_at: Option<&str>) -> Value {
        let mut payload = json!({
            "router_id": router_id,
            "interfaces": self.interfaces,
            "accounts": self.accounts,
            "active_sessions": self.sessions,
        });
        if let Some(ts) = sampled_at {
            payload["sampled_at"] = json!(ts);
        }
        payload
    }

    /// Payload push horodaté maintenant
    pub fn push_payload_now(&self, router_id: &str) -> Value {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        self.push_payload(router_id, Some(&now))
    }
}
