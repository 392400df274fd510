//! Normalisation des identifiants abonnés.
//!
//! Les interfaces arrivent sous la forme `<pppoe-alice>`, les comptes sous
//! `alice` : tout passe par `normalize` avant la moindre jointure.

use crate::models::SubscriberKey;

/// Préfixe de type de connexion retiré des noms d'interface (insensible à la casse)
pub const CONNECTION_PREFIX: &str = "pppoe-";

/// Canonicalise un nom brut en clé comparable.
///
/// Minuscules, décorations `<...>` et préfixe `pppoe-` retirés jusqu'au point fixe,
/// ce qui rend la fonction idempotente même sur `<<pppoe-pppoe-x>>`.
pub fn normalize(raw: &str) -> SubscriberKey {
    let lowered = raw.to_lowercase();
    let mut current = lowered.as_str();

    loop {
        let before = current;
        current = current.trim();
        current = current.strip_prefix('<').unwrap_or(current);
        current = current.strip_suffix('>').unwrap_or(current);
        current = current.trim();
        current = current.strip_prefix(CONNECTION_PREFIX).unwrap_or(current);
        if current == before {
            break;
        }
    }

    SubscriberKey(current.to_string())
}
