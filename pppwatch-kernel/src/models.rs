/**
 * MODÈLES PPPWATCH - Enregistrements typés du moteur de réconciliation
 *
 * RÔLE :
 * Types partagés entre l'ingestion, la fusion, le calcul de débit et la publication.
 * Les trois flux amont (interfaces, comptes PPP, sessions actives) ont chacun leur type,
 * les lignes abonnés et les stats agrégées sont dérivées à chaque cycle.
 *
 * CONVENTION DE DIRECTION (fixe pour tout le système) :
 * point de vue routeur : octets `rx` de l'interface -> `download_rate`,
 * octets `tx` -> `upload_rate`.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;

/// Identifiant d'un routeur supervisé (clé du registre de contextes)
pub type RouterId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterfaceKind {
    PppoeIn,
    Other,
}

impl InterfaceKind {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("pppoe-in") {
            InterfaceKind::PppoeIn
        } else {
            InterfaceKind::Other
        }
    }
}

/// Lecture brute des compteurs d'une interface, valable pour un seul cycle
#[derive(Debug, Clone, PartialEq)]
pub struct RawInterfaceSample {
    pub name: String,
    pub kind: InterfaceKind,
    pub running: bool,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Compte abonné (ppp secret) : métadonnées statiques et plan
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub name: String,
    pub profile: String,
    pub disabled: bool,
    pub caller_id: Option<String>,
    pub last_logged_out: Option<OffsetDateTime>,
}

impl AccountRecord {
    /// Désactivé administrativement : drapeau `disabled` ou profil "disabled"
    pub fn is_disabled(&self) -> bool {
        self.disabled || self.profile.trim().eq_ignore_ascii_case("disabled")
    }

    /// Identifiants déclarés par le compte, candidats à la jointure
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.caller_id.as_deref())
    }
}

/// Session PPP active (présente uniquement tant que l'abonné est connecté)
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSession {
    pub name: String,
    pub address: String,
    pub uptime: std::time::Duration,
    pub last_seen_at: OffsetDateTime,
}

/// Clé normalisée d'un abonné. Construite uniquement par `normalize::normalize`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberKey(pub(crate) String);

impl SubscriberKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberStatus {
    Online,
    Offline,
    Disabled,
}

/// Ligne abonné publiée. Jamais modifiée après publication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriberRow {
    pub key: SubscriberKey,
    /// Nom affiché : nom brut de l'interface, ou du compte si pas d'interface
    pub display_name: String,
    pub profile: String,
    pub status: SubscriberStatus,
    /// Mbps, pleine précision
    pub download_rate: f64,
    /// Mbps, pleine précision
    pub upload_rate: f64,
    pub address: Option<String>,
    pub uptime: Option<std::time::Duration>,
    pub last_uptime: Option<std::time::Duration>,
    /// `None` = inconnu (distinct de zéro)
    pub downtime_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub total_accounts: usize,
    pub online_accounts: usize,
    pub offline_accounts: usize,
    pub enabled_accounts: usize,
    pub disabled_accounts: usize,
    pub total_upload_rate: f64,
    pub total_download_rate: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl AggregateStats {
    pub fn empty(at: OffsetDateTime) -> Self {
        Self {
            total_accounts: 0,
            online_accounts: 0,
            offline_accounts: 0,
            enabled_accounts: 0,
            disabled_accounts: 0,
            total_upload_rate: 0.0,
            total_download_rate: 0.0,
            last_updated: at,
        }
    }
}

/// Snapshot complet d'un cycle : lignes + stats, remplacé en bloc au cycle suivant
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub router_id: RouterId,
    /// 0 = snapshot initial vide, incrémenté à chaque publication
    pub sequence: u64,
    pub rows: Vec<SubscriberRow>,
    pub stats: AggregateStats,
}

impl Snapshot {
    pub fn empty(router_id: &str, at: OffsetDateTime) -> Self {
        Self {
            router_id: router_id.to_string(),
            sequence: 0,
            rows: Vec::new(),
            stats: AggregateStats::empty(at),
        }
    }

    pub fn row(&self, key: &str) -> Option<&SubscriberRow> {
        self.rows.iter().find(|r| r.key.as_str() == key)
    }
}

/// Les trois jeux d'enregistrements d'un même instant amont
#[derive(Debug, Clone, Default)]
pub struct RawRecordSets {
    pub interfaces: Vec<RawInterfaceSample>,
    pub accounts: Vec<AccountRecord>,
    pub active_sessions: Vec<ActiveSession>,
}

/// Événements diffusés aux abonnés d'un contexte routeur
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Published(Arc<Snapshot>),
    FetchFailed {
        router_id: RouterId,
        error: String,
        at: OffsetDateTime,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Idle,
    Fetching,
    Publishing,
    Stopped,
}

/// Arrondi d'affichage (2 décimales), l'agrégation garde la pleine précision
pub fn display_mbps(rate: f64) -> f64 {
    (rate * 100.0).round() / 100.0
}
