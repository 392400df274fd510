//! Statistiques agrégées, recalculées en entier à chaque cycle.

use crate::models::{AggregateStats, SubscriberRow, SubscriberStatus};
use time::OffsetDateTime;

/// Fonction pure sur l'ensemble des lignes.
///
/// Disabled compte comme offline dans le chiffre principal et reste compté à part.
/// Seules les lignes Online contribuent aux débits totaux.
pub fn aggregate(rows: &[SubscriberRow], now: OffsetDateTime) -> AggregateStats {
    let total_accounts = rows.len();
    let online: Vec<&SubscriberRow> = rows
        .iter()
        .filter(|r| r.status == SubscriberStatus::Online)
        .collect();
    let enabled_accounts = rows
        .iter()
        .filter(|r| r.status != SubscriberStatus::Disabled)
        .count();

    AggregateStats {
        total_accounts,
        online_accounts: online.len(),
        offline_accounts: total_accounts - online.len(),
        enabled_accounts,
        disabled_accounts: total_accounts - enabled_accounts,
        total_upload_rate: online.iter().map(|r| r.upload_rate).sum(),
        total_download_rate: online.iter().map(|r| r.download_rate).sum(),
        last_updated: now,
    }
}
