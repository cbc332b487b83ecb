use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use guardrails_core::error::AppError;
use guardrails_core::models::Fingerprint;
use guardrails_core::traits::FingerprintStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One stored fingerprint with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFingerprint {
    pub fingerprint: Fingerprint,
    pub updated_at: DateTime<Utc>,
}

/// Fingerprint store backed by a single JSON file.
///
/// The whole map is held in memory and rewritten on every `put` through a
/// temporary file and rename, so a crash mid-write leaves the previous
/// contents intact.
#[derive(Clone)]
pub struct FileFingerprintStore {
    path: PathBuf,
    entries: Arc<Mutex<BTreeMap<String, StoredFingerprint>>>,
}

impl FileFingerprintStore {
    /// Load the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, AppError> {
        let path = path.into();
        let entries = Self::load(&path).await?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened fingerprint store");
        Ok(Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    /// Read the store at `path` without keeping it open for writes.
    pub async fn load(path: &Path) -> Result<BTreeMap<String, StoredFingerprint>, AppError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                AppError::StoreError(format!("Corrupt fingerprint store {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(AppError::StoreError(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every stored entry, ordered by key.
    pub async fn entries(&self) -> Vec<(String, StoredFingerprint)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn persist(&self, entries: &BTreeMap<String, StoredFingerprint>) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(entries)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            AppError::StoreError(format!("Failed to replace {}: {e}", self.path.display()))
        })
    }
}

impl FingerprintStore for FileFingerprintStore {
    async fn get(&self, key: &str) -> Result<Option<Fingerprint>, AppError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(key).map(|e| e.fingerprint.clone()))
    }

    async fn put(&self, key: &str, fingerprint: &Fingerprint) -> Result<(), AppError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(
            key.to_string(),
            StoredFingerprint {
                fingerprint: fingerprint.clone(),
                updated_at: Utc::now(),
            },
        );

        if let Err(e) = self.persist(&entries).await {
            // Keep memory and disk in agreement.
            match previous {
                Some(prev) => entries.insert(key.to_string(), prev),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}
