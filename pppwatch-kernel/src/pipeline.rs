/**
 * PIPELINE DE RÉCONCILIATION - Contexte de calcul propre à un routeur
 *
 * RÔLE :
 * Le `Reconciler` possède tout l'état dérivé d'un routeur (cache d'échantillons,
 * journal de présence) et enchaîne, de façon synchrone :
 *   fusion -> débits -> présence/downtime -> agrégation -> éviction
 *
 * Le polling et le push passent tous deux par `run_sampled`, ce qui garantit une
 * sortie identique pour un même état amont.
 */

use crate::aggregate::aggregate;
use crate::downtime::{annotate, PresenceLog};
use crate::merge::merge;
use crate::models::{AggregateStats, InterfaceKind, RawRecordSets, SubscriberRow};
use crate::sampling::{EvictionPolicy, RateCalculator, SampleCache, SampleCacheEntry};
use time::OffsetDateTime;
use tracing::debug;

/// Sortie d'un cycle, prête à être publiée
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub rows: Vec<SubscriberRow>,
    pub stats: AggregateStats,
    pub evicted: usize,
}

#[derive(Debug)]
pub struct Reconciler {
    rates: RateCalculator,
    presence: PresenceLog,
    eviction: EvictionPolicy,
    monitored: InterfaceKind,
}

impl Reconciler {
    pub fn new(monitored: InterfaceKind, eviction: EvictionPolicy) -> Self {
        Self {
            rates: RateCalculator::new(),
            presence: PresenceLog::new(),
            eviction,
            monitored,
        }
    }

    /// Repart de bases persistées (redémarrage du kernel)
    pub fn restore_baselines(&mut self, entries: Vec<SampleCacheEntry>) {
        self.rates = RateCalculator::with_cache(SampleCache::from_entries(entries));
    }

    pub fn baselines(&self) -> Vec<SampleCacheEntry> {
        self.rates.cache().entries().cloned().collect()
    }

    pub fn cache_len(&self) -> usize {
        self.rates.cache().len()
    }

    /// Cycle dont les compteurs ont été lus à l'instant de l'agrégation (polling)
    pub fn run(&mut self, sets: &RawRecordSets, now: OffsetDateTime) -> CycleOutput {
        self.run_sampled(sets, now, now)
    }

    /// `sampled_at` date les compteurs (deltas de débit, présence) ;
    /// `aggregated_at` est l'horloge du cycle (downtime, `last_updated`)
    pub fn run_sampled(
        &mut self,
        sets: &RawRecordSets,
        sampled_at: OffsetDateTime,
        aggregated_at: OffsetDateTime,
    ) -> CycleOutput {
        self.rates.begin_cycle();

        let mut merged = merge(&sets.interfaces, &sets.accounts, &sets.active_sessions, self.monitored);

        for m in merged.iter_mut() {
            let Some(counters) = m.counters else { continue };
            let rates = self
                .rates
                .compute_rate(&m.row.key, counters.rx_bytes, counters.tx_bytes, sampled_at);
            m.row.download_rate = rates.download;
            m.row.upload_rate = rates.upload;
        }

        self.presence.record_online(&merged, sampled_at);
        annotate(&mut merged, &self.presence, aggregated_at);

        let rows: Vec<SubscriberRow> = merged.into_iter().map(|m| m.row).collect();
        let stats = aggregate(&rows, aggregated_at);

        let evicted = self.rates.evict(self.eviction);
        if evicted > 0 {
            let cache = self.rates.cache();
            self.presence.retain(|key| cache.get(key).is_some() || rows.iter().any(|r| &r.key == key));
            debug!(evicted, remaining = cache.len(), "stale baselines evicted");
        }

        CycleOutput { rows, stats, evicted }
    }
}
