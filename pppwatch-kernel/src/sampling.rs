/**
 * ÉCHANTILLONNAGE & DÉBITS - Cache du cycle précédent et calcul des débits
 *
 * RÔLE :
 * Le `RateCalculator` possède seul le `SampleCache` (une entrée par abonné) et
 * transforme un delta de compteurs d'octets en débit (Mbps).
 *
 * POLITIQUES :
 * - Première observation d'une clé : débit (0, 0), l'échantillon devient la base
 * - dt <= 0 (horloge, doublon) : débit (0, 0), cache inchangé
 * - Delta négatif (reset compteur, reboot, wrap 64 bits) : delta ramené à 0
 * - Sinon : cache toujours écrasé par l'échantillon courant
 */

use crate::models::SubscriberKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCacheEntry {
    pub key: SubscriberKey,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub sampled_at: OffsetDateTime,
}

/// Politique d'éviction des bases qui ne sont plus rafraîchies.
/// Point d'extension : aucune éviction par défaut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    #[default]
    Never,
    /// Supprime les entrées non rafraîchies depuis N cycles
    AfterIdleCycles(u32),
}

impl EvictionPolicy {
    pub fn from_config(evict_after_cycles: Option<u32>) -> Self {
        match evict_after_cycles {
            Some(n) if n > 0 => EvictionPolicy::AfterIdleCycles(n),
            _ => EvictionPolicy::Never,
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    entry: SampleCacheEntry,
    refreshed_cycle: u64,
}

/// Store clé -> dernier échantillon, last-write-wins, jamais moyenné
#[derive(Debug, Default)]
pub struct SampleCache {
    slots: HashMap<SubscriberKey, Slot>,
    cycle: u64,
}

impl SampleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruit un cache depuis des bases persistées
    pub fn from_entries(entries: impl IntoIterator<Item = SampleCacheEntry>) -> Self {
        let mut cache = Self::new();
        for entry in entries {
            cache.put(entry);
        }
        cache
    }

    pub fn get(&self, key: &SubscriberKey) -> Option<&SampleCacheEntry> {
        self.slots.get(key).map(|slot| &slot.entry)
    }

    /// Remplace intégralement toute entrée existante pour cette clé
    pub fn put(&mut self, entry: SampleCacheEntry) {
        let refreshed_cycle = self.cycle;
        self.slots.insert(entry.key.clone(), Slot { entry, refreshed_cycle });
    }

    /// Marque la clé comme vue ce cycle sans toucher à la base
    pub fn touch(&mut self, key: &SubscriberKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.refreshed_cycle = self.cycle;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn begin_cycle(&mut self) {
        self.cycle += 1;
    }

    /// Applique la politique d'éviction, retourne le nombre d'entrées supprimées
    pub fn evict(&mut self, policy: EvictionPolicy) -> usize {
        let EvictionPolicy::AfterIdleCycles(max_idle) = policy else {
            return 0;
        };
        let current = self.cycle;
        let before = self.slots.len();
        self.slots.retain(|key, slot| {
            let keep = current.saturating_sub(slot.refreshed_cycle) < u64::from(max_idle);
            if !keep {
                debug!(subscriber = %key, "evicting stale baseline");
            }
            keep
        });
        before - self.slots.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &SampleCacheEntry> {
        self.slots.values().map(|slot| &slot.entry)
    }
}

/// Débits instantanés en Mbps (pleine précision)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rates {
    pub download: f64,
    pub upload: f64,
}

/// Issue d'un calcul, utile pour les logs et les tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateOutcome {
    Baseline,
    ClockAnomaly,
    Computed { rx_reset: bool, tx_reset: bool },
}

/// Delta de compteur ; une valeur plus basse que la base compte pour 0
pub fn clamped_delta(current: u64, prior: u64) -> u64 {
    current.saturating_sub(prior)
}

fn to_mbps(delta_bytes: u64, dt_seconds: f64) -> f64 {
    (delta_bytes as f64) * 8.0 / dt_seconds / 1e6
}

#[derive(Debug, Default)]
pub struct RateCalculator {
    cache: SampleCache,
}

impl RateCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: SampleCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &SampleCache {
        &self.cache
    }

    pub fn begin_cycle(&mut self) {
        self.cache.begin_cycle();
    }

    pub fn evict(&mut self, policy: EvictionPolicy) -> usize {
        self.cache.evict(policy)
    }

    /// Débit (download, upload) pour `key` et mise à jour de sa base.
    /// rx -> download, tx -> upload (point de vue routeur).
    pub fn compute_rate(
        &mut self,
        key: &SubscriberKey,
        current_rx: u64,
        current_tx: u64,
        now: OffsetDateTime,
    ) -> Rates {
        self.compute_rate_with_outcome(key, current_rx, current_tx, now).0
    }

    pub fn compute_rate_with_outcome(
        &mut self,
        key: &SubscriberKey,
        current_rx: u64,
        current_tx: u64,
        now: OffsetDateTime,
    ) -> (Rates, RateOutcome) {
        let current = SampleCacheEntry {
            key: key.clone(),
            rx_bytes: current_rx,
            tx_bytes: current_tx,
            sampled_at: now,
        };

        let Some(prior) = self.cache.get(key) else {
            self.cache.put(current);
            return (Rates::default(), RateOutcome::Baseline);
        };

        let dt = (now - prior.sampled_at).as_seconds_f64();
        if dt <= 0.0 {
            debug!(subscriber = %key, dt, "non-positive sample interval, rate skipped");
            self.cache.touch(key);
            return (Rates::default(), RateOutcome::ClockAnomaly);
        }

        let rx_reset = current_rx < prior.rx_bytes;
        let tx_reset = current_tx < prior.tx_bytes;
        if rx_reset || tx_reset {
            info!(
                subscriber = %key,
                prior_rx = prior.rx_bytes,
                current_rx,
                prior_tx = prior.tx_bytes,
                current_tx,
                "byte counter went backwards, delta clamped to zero"
            );
        }

        let rates = Rates {
            download: to_mbps(clamped_delta(current_rx, prior.rx_bytes), dt),
            upload: to_mbps(clamped_delta(current_tx, prior.tx_bytes), dt),
        };

        self.cache.put(current);
        (rates, RateOutcome::Computed { rx_reset, tx_reset })
    }
}
