//! Vues JSON exposées (REST et bus) : débits arrondis à 2 décimales,
//! durées en secondes, horodatages RFC3339.

use crate::models::{display_mbps, AggregateStats, Snapshot, SubscriberRow, SubscriberStatus};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RowView {
    pub key: String,
    pub name: String,
    pub profile: String,
    pub status: SubscriberStatus,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub address: Option<String>,
    pub uptime_seconds: Option<u64>,
    pub last_uptime_seconds: Option<u64>,
    /// null = inconnu
    pub downtime_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsView {
    pub total_accounts: usize,
    pub online_accounts: usize,
    pub offline_accounts: usize,
    pub enabled_accounts: usize,
    pub disabled_accounts: usize,
    pub total_download_mbps: f64,
    pub total_upload_mbps: f64,
    pub last_updated: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotView {
    pub router_id: String,
    pub sequence: u64,
    pub rows: Vec<RowView>,
    pub stats: StatsView,
}

impl From<&SubscriberRow> for RowView {
    fn from(row: &SubscriberRow) -> Self {
        Self {
            key: row.key.to_string(),
            name: row.display_name.clone(),
            profile: row.profile.clone(),
            status: row.status,
            download_mbps: display_mbps(row.download_rate),
            upload_mbps: display_mbps(row.upload_rate),
            address: row.address.clone(),
            uptime_seconds: row.uptime.map(|d| d.as_secs()),
            last_uptime_seconds: row.last_uptime.map(|d| d.as_secs()),
            downtime_seconds: row.downtime_seconds,
        }
    }
}

impl From<&AggregateStats> for StatsView {
    fn from(stats: &AggregateStats) -> Self {
        Self {
            total_accounts: stats.total_accounts,
            online_accounts: stats.online_accounts,
            offline_accounts: stats.offline_accounts,
            enabled_accounts: stats.enabled_accounts,
            disabled_accounts: stats.disabled_accounts,
            total_download_mbps: display_mbps(stats.total_download_rate),
            total_upload_mbps: display_mbps(stats.total_upload_rate),
            last_updated: stats.last_updated.format(&Rfc3339).unwrap_or_default(),
        }
    }
}

impl From<&Snapshot> for SnapshotView {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            router_id: snapshot.router_id.clone(),
            sequence: snapshot.sequence,
            rows: snapshot.rows.iter().map(RowView::from).collect(),
            stats: StatsView::from(&snapshot.stats),
        }
    }
}
