/**
 * PERSISTANCE DES BASES - Stockage injectable du cache d'échantillons
 *
 * RÔLE :
 * Permet de retrouver les bases de débit après un redémarrage du kernel, sans
 * quoi le premier cycle de chaque abonné publie (0, 0).
 *
 * FONCTIONNEMENT :
 * - `NullBaselineStore` : rien n'est conservé (défaut)
 * - `JsonBaselineStore` : un fichier JSON par routeur dans `baseline_dir`
 * - Chargé à l'attachement d'un routeur, sauvegardé après chaque cycle réussi
 */

use crate::error::BaselineError;
use crate::sampling::SampleCacheEntry;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Appelé depuis la tâche du routeur : les implémentations ne doivent pas bloquer
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load(&self, router_id: &str) -> Result<Vec<SampleCacheEntry>, BaselineError>;
    async fn save(&self, router_id: &str, entries: &[SampleCacheEntry]) -> Result<(), BaselineError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullBaselineStore;

#[async_trait]
impl BaselineStore for NullBaselineStore {
    async fn load(&self, _router_id: &str) -> Result<Vec<SampleCacheEntry>, BaselineError> {
        Ok(Vec::new())
    }

    async fn save(&self, _router_id: &str, _entries: &[SampleCacheEntry]) -> Result<(), BaselineError> {
        Ok(())
    }
}

/// Un fichier `<router_id>.json` par routeur
#[derive(Debug, Clone)]
pub struct JsonBaselineStore {
    dir: PathBuf,
}

impl JsonBaselineStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self, BaselineError> {
        let dir = dir.into();
        // création synchrone : appelé une fois au démarrage, hors tâche routeur
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, router_id: &str) -> PathBuf {
        // l'identifiant sert de nom de fichier : on neutralise les séparateurs
        let safe: String = router_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl BaselineStore for JsonBaselineStore {
    async fn load(&self, router_id: &str) -> Result<Vec<SampleCacheEntry>, BaselineError> {
        let path = self.path_for(router_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<SampleCacheEntry> = serde_json::from_str(&content)?;
        debug!(router = router_id, count = entries.len(), "baselines loaded");
        Ok(entries)
    }

    async fn save(&self, router_id: &str, entries: &[SampleCacheEntry]) -> Result<(), BaselineError> {
        let path = self.path_for(router_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
