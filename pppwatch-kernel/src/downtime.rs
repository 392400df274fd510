/**
 * DOWNTIME TRACKER - Temps écoulé depuis la dernière présence d'un abonné
 *
 * FONCTIONNEMENT :
 * - PresenceLog : dernière fois qu'une clé a été vue Online + uptime de cette session
 * - Pour les lignes Offline/Disabled : downtime = max(0, now - dernière présence)
 * - Dernière présence = la plus récente entre `last-logged-out` du compte et le PresenceLog
 * - Aucune information : downtime inconnu (None), jamais 0
 */

use crate::merge::MergedSubscriber;
use crate::models::{SubscriberKey, SubscriberStatus};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub last_seen_at: OffsetDateTime,
    pub last_uptime: Option<Duration>,
}

/// Mémoire de présence par clé, propre à un contexte routeur
#[derive(Debug, Default)]
pub struct PresenceLog {
    entries: HashMap<SubscriberKey, Presence>,
}

impl PresenceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SubscriberKey) -> Option<&Presence> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Enregistre les lignes Online du cycle
    pub fn record_online(&mut self, merged: &[MergedSubscriber], now: OffsetDateTime) {
        for m in merged.iter().filter(|m| m.row.status == SubscriberStatus::Online) {
            let last_seen_at = m.session_seen_at.unwrap_or(now);
            let last_uptime = m
                .row
                .uptime
                .or_else(|| self.entries.get(&m.row.key).and_then(|p| p.last_uptime));
            self.entries.insert(
                m.row.key.clone(),
                Presence {
                    last_seen_at,
                    last_uptime,
                },
            );
        }
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&SubscriberKey) -> bool) {
        self.entries.retain(|k, _| keep(k));
    }
}

/// Secondes depuis `last_seen`, bornées à 0 (horloge amont en avance)
pub fn downtime_seconds(last_seen: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (now - last_seen).whole_seconds().max(0)
}

/// Annote les lignes hors ligne avec leur downtime et leur dernier uptime
pub fn annotate(merged: &mut [MergedSubscriber], presence: &PresenceLog, now: OffsetDateTime) {
    for m in merged.iter_mut() {
        let known = presence.get(&m.row.key);
        m.row.last_uptime = known.and_then(|p| p.last_uptime);

        if m.row.status == SubscriberStatus::Online {
            m.row.downtime_seconds = None;
            continue;
        }

        let last_seen = match (m.last_logged_out, known.map(|p| p.last_seen_at)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        m.row.downtime_seconds = last_seen.map(|seen| downtime_seconds(seen, now));
    }
}
