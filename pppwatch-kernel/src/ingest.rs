/**
 * INGESTION - Frontière entre le JSON amont (RouterOS REST) et les types du moteur
 *
 * RÔLE :
 * Convertit les objets JSON lâchement typés (valeurs souvent en chaînes : "true",
 * "12345") en `RawInterfaceSample` / `AccountRecord` / `ActiveSession`.
 *
 * FONCTIONNEMENT :
 * - Champs obligatoires absents ou compteurs illisibles : enregistrement rejeté
 * - Champs optionnels : valeur par défaut explicite
 * - Chaque rejet est loggé en warn et compté, l'ingestion n'échoue jamais un cycle
 *
 * Le même chemin sert au polling (RouterOsClient) et au push MQTT.
 */

use crate::error::IngestError;
use crate::models::{AccountRecord, ActiveSession, InterfaceKind, RawInterfaceSample, RawRecordSets, RouterId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

type Record = Map<String, Value>;

/// Payload push : les trois jeux bruts d'un routeur, au format fil
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub router_id: RouterId,
    #[serde(default)]
    pub interfaces: Vec<Value>,
    #[serde(default)]
    pub accounts: Vec<Value>,
    #[serde(default)]
    pub active_sessions: Vec<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub sampled_at: Option<OffsetDateTime>,
}

/// Résultat d'une ingestion : enregistrements valides + nombre de rejets
#[derive(Debug, Clone, Default)]
pub struct Ingested<T> {
    pub records: Vec<T>,
    pub rejected: usize,
}

fn as_record<'a>(value: &'a Value, record: &'static str) -> Result<&'a Record, IngestError> {
    value.as_object().ok_or(IngestError::InvalidField {
        record,
        field: "<root>",
        value: value.to_string(),
    })
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_str(obj: &Record, record: &'static str, field: &'static str) -> Result<String, IngestError> {
    obj.get(field)
        .and_then(text)
        .ok_or(IngestError::MissingField { record, field })
}

fn optional_str(obj: &Record, field: &str) -> Option<String> {
    obj.get(field)
        .and_then(text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn invalid(record: &'static str, field: &'static str, value: &Value) -> IngestError {
    IngestError::InvalidField {
        record,
        field,
        value: value.to_string(),
    }
}

fn required_u64(obj: &Record, record: &'static str, field: &'static str) -> Result<u64, IngestError> {
    let value = obj.get(field).ok_or(IngestError::MissingField { record, field })?;
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(|| invalid(record, field, value)),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid(record, field, value)),
        _ => Err(invalid(record, field, value)),
    }
}

fn optional_bool(obj: &Record, record: &'static str, field: &'static str) -> Result<bool, IngestError> {
    let Some(value) = obj.get(field) else {
        return Ok(false);
    };
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" | "" => Ok(false),
            _ => Err(invalid(record, field, value)),
        },
        _ => Err(invalid(record, field, value)),
    }
}

fn optional_timestamp(
    obj: &Record,
    record: &'static str,
    field: &'static str,
) -> Result<Option<OffsetDateTime>, IngestError> {
    match optional_str(obj, field) {
        None => Ok(None),
        Some(raw) => OffsetDateTime::parse(&raw, &Rfc3339)
            .map(Some)
            .map_err(|_| IngestError::InvalidField { record, field, value: raw }),
    }
}

/// Durée RouterOS : `1w2d3h4m5s`, `45s`, ou un entier de secondes
pub fn parse_routeros_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'w' => 604_800,
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            _ => return None,
        };
        let n: u64 = digits.parse().ok()?;
        total = total.checked_add(n.checked_mul(unit)?)?;
        digits.clear();
    }
    // chiffres sans unité en fin de chaîne
    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

pub fn parse_interface(value: &Value) -> Result<RawInterfaceSample, IngestError> {
    const RECORD: &str = "interface";
    let obj = as_record(value, RECORD)?;
    Ok(RawInterfaceSample {
        name: required_str(obj, RECORD, "name")?,
        kind: optional_str(obj, "type")
            .map(|t| InterfaceKind::parse(&t))
            .unwrap_or(InterfaceKind::Other),
        running: optional_bool(obj, RECORD, "running")?,
        rx_bytes: required_u64(obj, RECORD, "rx-byte")?,
        tx_bytes: required_u64(obj, RECORD, "tx-byte")?,
    })
}

pub fn parse_account(value: &Value) -> Result<AccountRecord, IngestError> {
    const RECORD: &str = "account";
    let obj = as_record(value, RECORD)?;
    Ok(AccountRecord {
        name: required_str(obj, RECORD, "name")?,
        profile: optional_str(obj, "profile").unwrap_or_else(|| "default".to_string()),
        disabled: optional_bool(obj, RECORD, "disabled")?,
        caller_id: optional_str(obj, "caller-id"),
        last_logged_out: optional_timestamp(obj, RECORD, "last-logged-out")?,
    })
}

pub fn parse_session(value: &Value, sampled_at: OffsetDateTime) -> Result<ActiveSession, IngestError> {
    const RECORD: &str = "active session";
    let obj = as_record(value, RECORD)?;
    let uptime = match optional_str(obj, "uptime") {
        None => Duration::ZERO,
        Some(raw) => parse_routeros_duration(&raw).ok_or(IngestError::InvalidField {
            record: RECORD,
            field: "uptime",
            value: raw,
        })?,
    };
    Ok(ActiveSession {
        name: required_str(obj, RECORD, "name")?,
        address: optional_str(obj, "address").unwrap_or_default(),
        uptime,
        last_seen_at: optional_timestamp(obj, RECORD, "last-seen")?.unwrap_or(sampled_at),
    })
}

/// Applique `parse` à chaque objet, les rejets sont loggés puis ignorés
pub fn ingest_all<T>(
    router_id: &str,
    values: &[Value],
    mut parse: impl FnMut(&Value) -> Result<T, IngestError>,
) -> Ingested<T> {
    let mut out = Ingested {
        records: Vec::with_capacity(values.len()),
        rejected: 0,
    };
    for value in values {
        match parse(value) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                warn!(router = router_id, error = %e, "upstream record rejected");
                out.rejected += 1;
            }
        }
    }
    out
}

pub fn ingest_interfaces(router_id: &str, values: &[Value]) -> Ingested<RawInterfaceSample> {
    ingest_all(router_id, values, parse_interface)
}

pub fn ingest_accounts(router_id: &str, values: &[Value]) -> Ingested<AccountRecord> {
    ingest_all(router_id, values, parse_account)
}

pub fn ingest_sessions(router_id: &str, values: &[Value], sampled_at: OffsetDateTime) -> Ingested<ActiveSession> {
    ingest_all(router_id, values, |v| parse_session(v, sampled_at))
}

impl PushPayload {
    /// Convertit le payload en jeux typés ; retourne aussi le nombre de rejets
    pub fn into_record_sets(&self, received_at: OffsetDateTime) -> (RawRecordSets, usize) {
        let sampled_at = self.sampled_at.unwrap_or(received_at);
        let interfaces = ingest_interfaces(&self.router_id, &self.interfaces);
        let accounts = ingest_accounts(&self.router_id, &self.accounts);
        let sessions = ingest_sessions(&self.router_id, &self.active_sessions, sampled_at);
        let rejected = interfaces.rejected + accounts.rejected + sessions.rejected;
        (
            RawRecordSets {
                interfaces: interfaces.records,
                accounts: accounts.records,
                active_sessions: sessions.records,
            },
            rejected,
        )
    }
}
