//! Erreurs du kernel. Seule `FetchError` est visible des consommateurs
//! (via `MonitorEvent::FetchFailed`), le reste est traité localement.

use thiserror::Error;

/// Échec d'un des trois appels amont ; le cycle entier est abandonné
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error on {endpoint}: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} answered with status {status}")]
    Status { endpoint: String, status: u16 },
    #[error("invalid payload from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
    #[error("{endpoint} timed out")]
    Timeout { endpoint: String },
    #[error("router not configured upstream: {0}")]
    UnknownRouter(String),
}

/// Erreurs exposées par le `MonitorRegistry`
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("unknown router: {0}")]
    UnknownRouter(String),
    #[error("monitor for {0} is stopped")]
    Stopped(String),
    #[error(transparent)]
    Upstream(#[from] FetchError),
}

/// Rejet d'un enregistrement à la frontière d'ingestion, jamais fatal
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("{record} record is missing field `{field}`")]
    MissingField {
        record: &'static str,
        field: &'static str,
    },
    #[error("{record} record has invalid `{field}`: {value}")]
    InvalidField {
        record: &'static str,
        field: &'static str,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("baseline IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("baseline serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Message push refusé par le listener MQTT
#[derive(Debug, Error)]
pub enum PushError {
    #[error("not a push topic: {0}")]
    Topic(String),
    #[error("invalid push payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload router `{payload}` does not match topic router `{topic}`")]
    RouterMismatch { topic: String, payload: String },
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

#[derive(Debug, Error)]
#[error("publish to {topic} failed: {reason}")]
pub struct BusError {
    pub topic: String,
    pub reason: String,
}
