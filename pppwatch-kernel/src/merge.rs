/**
 * FUSION DES SNAPSHOTS - Jointure interfaces / comptes / sessions actives
 *
 * RÔLE :
 * Produit une ligne par abonné à partir des trois flux amont, tous ramenés
 * dans l'espace des `SubscriberKey`.
 *
 * RÈGLES :
 * - Seules les interfaces du type supervisé (pppoe-in) sont prises, toutes produisent
 *   une ligne, même sans compte ni session correspondants
 * - Un compte se joint par n'importe lequel de ses identifiants déclarés (nom, caller-id)
 * - La session se cherche d'abord par la clé de la ligne, puis par les identifiants
 *   du compte joint
 * - Disabled > Online/Offline : un compte désactivé l'emporte sur l'état de l'interface
 * - Deux interfaces sur la même clé : la dernière gagne, signalé en warn
 * - Les comptes sans interface produisent aussi une ligne (Offline / Disabled / Online
 *   si une session active existe), sans débit
 */

use crate::models::{
    AccountRecord, ActiveSession, InterfaceKind, RawInterfaceSample, SubscriberKey, SubscriberRow,
    SubscriberStatus,
};
use crate::normalize::normalize;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tracing::warn;

/// Profil affiché quand aucune fiche compte ne correspond
pub const UNKNOWN_PROFILE: &str = "unknown";

/// Compteurs bruts d'une interface retenue pour le calcul de débit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Ligne fusionnée avant calcul des débits et du downtime
#[derive(Debug, Clone, PartialEq)]
pub struct MergedSubscriber {
    pub row: SubscriberRow,
    pub counters: Option<Counters>,
    pub last_logged_out: Option<OffsetDateTime>,
    /// Horodatage de la session active correspondante, s'il y en a une
    pub session_seen_at: Option<OffsetDateTime>,
}

fn index_accounts(accounts: &[AccountRecord]) -> HashMap<SubscriberKey, usize> {
    let mut index = HashMap::new();

    // caller-id d'abord : le nom d'un compte prime sur l'alias d'un autre
    for (i, account) in accounts.iter().enumerate() {
        if let Some(caller_id) = account.caller_id.as_deref() {
            let key = normalize(caller_id);
            if !key.is_empty() {
                index.insert(key, i);
            }
        }
    }

    let mut seen_names = HashSet::new();
    for (i, account) in accounts.iter().enumerate() {
        let key = normalize(&account.name);
        if key.is_empty() {
            continue;
        }
        if !seen_names.insert(key.clone()) {
            warn!(subscriber = %key, "duplicate account key, last record wins");
        }
        index.insert(key, i);
    }

    index
}

fn index_sessions(sessions: &[ActiveSession]) -> HashMap<SubscriberKey, &ActiveSession> {
    let mut index = HashMap::new();
    for session in sessions {
        let key = normalize(&session.name);
        if key.is_empty() {
            continue;
        }
        if index.insert(key.clone(), session).is_some() {
            warn!(subscriber = %key, "duplicate active session key, last record wins");
        }
    }
    index
}

fn find_session<'a>(
    index: &HashMap<SubscriberKey, &'a ActiveSession>,
    key: &SubscriberKey,
    account: Option<&AccountRecord>,
) -> Option<&'a ActiveSession> {
    index.get(key).copied().or_else(|| {
        account?
            .identifiers()
            .map(normalize)
            .find_map(|id| index.get(&id).copied())
    })
}

fn session_fields(
    session: Option<&ActiveSession>,
) -> (Option<String>, Option<std::time::Duration>) {
    match session {
        Some(s) => {
            let address = (!s.address.is_empty()).then(|| s.address.clone());
            (address, Some(s.uptime))
        }
        None => (None, None),
    }
}

fn base_row(
    key: SubscriberKey,
    display_name: String,
    profile: String,
    status: SubscriberStatus,
    session: Option<&ActiveSession>,
) -> SubscriberRow {
    let (address, uptime) = session_fields(session);
    SubscriberRow {
        key,
        display_name,
        profile,
        status,
        download_rate: 0.0,
        upload_rate: 0.0,
        address,
        uptime,
        last_uptime: None,
        downtime_seconds: None,
    }
}

/// Joint les trois jeux d'enregistrements par clé normalisée
pub fn merge(
    interfaces: &[RawInterfaceSample],
    accounts: &[AccountRecord],
    active_sessions: &[ActiveSession],
    monitored: InterfaceKind,
) -> Vec<MergedSubscriber> {
    let account_index = index_accounts(accounts);
    let session_index = index_sessions(active_sessions);

    // Dédoublonnage des interfaces : ordre de première apparition, contenu du dernier
    let mut order: Vec<SubscriberKey> = Vec::new();
    let mut latest: HashMap<SubscriberKey, &RawInterfaceSample> = HashMap::new();
    for iface in interfaces.iter().filter(|i| i.kind == monitored) {
        let key = normalize(&iface.name);
        if key.is_empty() {
            warn!(interface = %iface.name, "interface name normalizes to an empty key, skipped");
            continue;
        }
        match latest.insert(key.clone(), iface) {
            Some(previous) => warn!(
                subscriber = %key,
                previous = %previous.name,
                current = %iface.name,
                "duplicate interface key, last record wins"
            ),
            None => order.push(key),
        }
    }

    let mut matched_accounts = HashSet::new();
    let mut merged = Vec::with_capacity(order.len() + accounts.len());

    for key in order {
        let iface = latest[&key];
        let account = account_index.get(&key).map(|&i| {
            matched_accounts.insert(i);
            &accounts[i]
        });
        let session = find_session(&session_index, &key, account);

        let status = match account {
            Some(acc) if acc.is_disabled() => SubscriberStatus::Disabled,
            _ if iface.running => SubscriberStatus::Online,
            _ => SubscriberStatus::Offline,
        };
        let profile = account
            .map(|acc| acc.profile.clone())
            .unwrap_or_else(|| UNKNOWN_PROFILE.to_string());

        merged.push(MergedSubscriber {
            row: base_row(key, iface.name.clone(), profile, status, session),
            counters: Some(Counters {
                rx_bytes: iface.rx_bytes,
                tx_bytes: iface.tx_bytes,
            }),
            last_logged_out: account.and_then(|acc| acc.last_logged_out),
            session_seen_at: session.map(|s| s.last_seen_at),
        });
    }

    let mut emitted: HashSet<SubscriberKey> =
        merged.iter().map(|m| m.row.key.clone()).collect();

    for (i, account) in accounts.iter().enumerate() {
        if matched_accounts.contains(&i) {
            continue;
        }
        let key = normalize(&account.name);
        if key.is_empty() || account_index.get(&key) != Some(&i) || !emitted.insert(key.clone()) {
            continue;
        }
        let session = find_session(&session_index, &key, Some(account));
        let status = if account.is_disabled() {
            SubscriberStatus::Disabled
        } else if session.is_some() {
            SubscriberStatus::Online
        } else {
            SubscriberStatus::Offline
        };

        merged.push(MergedSubscriber {
            row: base_row(key, account.name.clone(), account.profile.clone(), status, session),
            counters: None,
            last_logged_out: account.last_logged_out,
            session_seen_at: session.map(|s| s.last_seen_at),
        });
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn iface(name: &str, running: bool) -> RawInterfaceSample {
        RawInterfaceSample {
            name: name.into(),
            kind: InterfaceKind::PppoeIn,
            running,
            rx_bytes: 10,
            tx_bytes: 20,
        }
    }

    fn account(name: &str, profile: &str) -> AccountRecord {
        AccountRecord {
            name: name.into(),
            profile: profile.into(),
            disabled: false,
            caller_id: None,
            last_logged_out: None,
        }
    }

    fn session(name: &str, address: &str) -> ActiveSession {
        ActiveSession {
            name: name.into(),
            address: address.into(),
            uptime: std::time::Duration::from_secs(3_600),
            last_seen_at: datetime!(2024-05-01 12:00:00 UTC),
        }
    }

    fn statuses(merged: &[MergedSubscriber]) -> Vec<(&str, SubscriberStatus)> {
        merged.iter().map(|m| (m.row.key.as_str(), m.row.status)).collect()
    }

    #[test]
    fn test_joins_three_sources_by_normalized_key() {
        let merged = merge(
            &[iface("<pppoe-alice>", true)],
            &[account("Alice", "10M")],
            &[session("alice", "10.0.0.2")],
            InterfaceKind::PppoeIn,
        );

        assert_eq!(merged.len(), 1);
        let row = &merged[0].row;
        assert_eq!(row.key.as_str(), "alice");
        assert_eq!(row.display_name, "<pppoe-alice>");
        assert_eq!(row.profile, "10M");
        assert_eq!(row.status, SubscriberStatus::Online);
        assert_eq!(row.address.as_deref(), Some("10.0.0.2"));
        assert_eq!(row.uptime, Some(std::time::Duration::from_secs(3_600)));
        assert_eq!(merged[0].counters, Some(Counters { rx_bytes: 10, tx_bytes: 20 }));
    }

    #[test]
    fn test_interface_without_account_uses_placeholder_profile() {
        let merged = merge(&[iface("<pppoe-ghost>", false)], &[], &[], InterfaceKind::PppoeIn);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].row.profile, UNKNOWN_PROFILE);
        assert_eq!(merged[0].row.display_name, "<pppoe-ghost>");
        assert_eq!(merged[0].row.status, SubscriberStatus::Offline);
    }

    #[test]
    fn test_other_interface_kinds_are_ignored() {
        let mut ether = iface("ether1", true);
        ether.kind = InterfaceKind::Other;
        let merged = merge(&[ether], &[], &[], InterfaceKind::PppoeIn);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_disabled_account_without_interface() {
        let merged = merge(&[], &[account("bob", "disabled")], &[], InterfaceKind::PppoeIn);
        assert_eq!(statuses(&merged), vec![("bob", SubscriberStatus::Disabled)]);
        assert!(merged[0].counters.is_none());
    }

    #[test]
    fn test_disabled_takes_precedence_over_running_interface() {
        let mut acc = account("frank", "10M");
        acc.disabled = true;
        let merged = merge(&[iface("<pppoe-frank>", true)], &[acc], &[], InterfaceKind::PppoeIn);
        assert_eq!(statuses(&merged), vec![("frank", SubscriberStatus::Disabled)]);
    }

    #[test]
    fn test_duplicate_interfaces_last_one_wins() {
        let merged = merge(
            &[iface("<pppoe-carol>", true), iface("<PPPoE-Carol>", false)],
            &[account("carol", "5M")],
            &[],
            InterfaceKind::PppoeIn,
        );
        assert_eq!(statuses(&merged), vec![("carol", SubscriberStatus::Offline)]);
        assert_eq!(merged[0].row.display_name, "<PPPoE-Carol>");
    }

    #[test]
    fn test_account_matched_by_caller_id() {
        let mut acc = account("gina", "20M");
        acc.caller_id = Some("AA:BB:CC:DD:EE:FF".into());
        let merged = merge(
            &[iface("<pppoe-aa:bb:cc:dd:ee:ff>", true)],
            &[acc],
            &[],
            InterfaceKind::PppoeIn,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].row.profile, "20M");
        assert_eq!(merged[0].row.key.as_str(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_caller_id_join_finds_session_named_after_account() {
        let mut acc = account("gina", "20M");
        acc.caller_id = Some("AA:BB:CC:DD:EE:FF".into());
        let merged = merge(
            &[iface("<pppoe-aa:bb:cc:dd:ee:ff>", true)],
            &[acc],
            &[session("gina", "10.0.0.7")],
            InterfaceKind::PppoeIn,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].row.address.as_deref(), Some("10.0.0.7"));
        assert_eq!(merged[0].row.uptime, Some(std::time::Duration::from_secs(3_600)));
        assert_eq!(merged[0].session_seen_at, Some(datetime!(2024-05-01 12:00:00 UTC)));
    }

    #[test]
    fn test_unmatched_accounts_follow_interface_rows() {
        let merged = merge(
            &[iface("<pppoe-alice>", true)],
            &[account("alice", "10M"), account("henry", "5M"), account("ivy", "5M")],
            &[session("ivy", "10.0.0.9")],
            InterfaceKind::PppoeIn,
        );
        assert_eq!(
            statuses(&merged),
            vec![
                ("alice", SubscriberStatus::Online),
                ("henry", SubscriberStatus::Offline),
                ("ivy", SubscriberStatus::Online),
            ]
        );
        assert_eq!(merged[2].row.address.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_empty_keys_never_join() {
        let merged = merge(
            &[iface("<pppoe->", true)],
            &[account("", "10M")],
            &[session("", "10.0.0.1")],
            InterfaceKind::PppoeIn,
        );
        assert!(merged.is_empty());
    }
}
