/**
 * COLLABORATEUR AMONT - Accès à l'API des routeurs
 *
 * RÔLE :
 * `RouterApi` est la couture entre le moteur et le routeur : trois listes brutes
 * par routeur. `RouterOsClient` l'implémente sur l'API REST RouterOS
 * (`/rest/interface`, `/rest/ppp/secret`, `/rest/ppp/active`).
 *
 * FONCTIONNEMENT :
 * - `fetch_all` lance les trois appels en parallèle et attend les trois
 * - Un seul échec (HTTP, statut, décodage, timeout) fait échouer l'ensemble :
 *   un résultat partiel n'est jamais fusionné
 */

use crate::error::FetchError;
use crate::ingest::{ingest_accounts, ingest_interfaces, ingest_sessions};
use crate::models::{AccountRecord, ActiveSession, RawInterfaceSample, RawRecordSets};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

#[async_trait]
pub trait RouterApi: Send + Sync {
    async fn list_interfaces(&self, router_id: &str) -> Result<Vec<RawInterfaceSample>, FetchError>;
    async fn list_accounts(&self, router_id: &str) -> Result<Vec<AccountRecord>, FetchError>;
    async fn list_active_sessions(&self, router_id: &str) -> Result<Vec<ActiveSession>, FetchError>;
}

async fn bounded<T>(
    endpoint: &str,
    limit: Duration,
    call: impl Future<Output = Result<T, FetchError>>,
) -> Result<T, FetchError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| FetchError::Timeout {
            endpoint: endpoint.to_string(),
        })?
}

/// Les trois jeux bruts d'un même instant, ou l'erreur du premier appel en échec
pub async fn fetch_all(api: &dyn RouterApi, router_id: &str, limit: Duration) -> Result<RawRecordSets, FetchError> {
    let (interfaces, accounts, active_sessions) = tokio::try_join!(
        bounded("interface", limit, api.list_interfaces(router_id)),
        bounded("ppp/secret", limit, api.list_accounts(router_id)),
        bounded("ppp/active", limit, api.list_active_sessions(router_id)),
    )?;
    Ok(RawRecordSets {
        interfaces,
        accounts,
        active_sessions,
    })
}

/// Coordonnées d'un routeur RouterOS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterEndpoint {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct RouterOsClient {
    http: reqwest::Client,
    endpoints: RwLock<HashMap<String, RouterEndpoint>>,
}

impl RouterOsClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, router_id: &str, endpoint: RouterEndpoint) {
        self.endpoints.write().insert(router_id.to_string(), endpoint);
    }

    pub fn unregister(&self, router_id: &str) {
        self.endpoints.write().remove(router_id);
    }

    fn endpoint(&self, router_id: &str) -> Result<RouterEndpoint, FetchError> {
        self.endpoints
            .read()
            .get(router_id)
            .cloned()
            .ok_or_else(|| FetchError::UnknownRouter(router_id.to_string()))
    }

    async fn get_list(&self, router_id: &str, path: &str) -> Result<Vec<Value>, FetchError> {
        let endpoint = self.endpoint(router_id)?;
        let url = format!("{}/rest/{}", endpoint.base_url.trim_end_matches('/'), path);

        let mut request = self.http.get(&url);
        if let Some(user) = endpoint.username.as_deref() {
            request = request.basic_auth(user, endpoint.password.as_deref());
        }

        let response = request.send().await.map_err(|e| http_error(&url, e))?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                endpoint: url,
                status: response.status().as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(|e| FetchError::Decode {
            endpoint: url.clone(),
            reason: e.to_string(),
        })?;
        match body {
            Value::Array(items) => {
                debug!(router = router_id, path, count = items.len(), "upstream list fetched");
                Ok(items)
            }
            other => Err(FetchError::Decode {
                endpoint: url,
                reason: format!("expected a JSON array, got {}", json_kind(&other)),
            }),
        }
    }
}

impl Default for RouterOsClient {
    fn default() -> Self {
        Self::new()
    }
}

fn http_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            endpoint: url.to_string(),
        }
    } else {
        FetchError::Http {
            endpoint: url.to_string(),
            source: e,
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl RouterApi for RouterOsClient {
    async fn list_interfaces(&self, router_id: &str) -> Result<Vec<RawInterfaceSample>, FetchError> {
        let values = self.get_list(router_id, "interface").await?;
        Ok(ingest_interfaces(router_id, &values).records)
    }

    async fn list_accounts(&self, router_id: &str) -> Result<Vec<AccountRecord>, FetchError> {
        let values = self.get_list(router_id, "ppp/secret").await?;
        Ok(ingest_accounts(router_id, &values).records)
    }

    async fn list_active_sessions(&self, router_id: &str) -> Result<Vec<ActiveSession>, FetchError> {
        let values = self.get_list(router_id, "ppp/active").await?;
        Ok(ingest_sessions(router_id, &values, OffsetDateTime::now_utc()).records)
    }
}
