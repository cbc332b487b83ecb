//! Structural drift detection.
//!
//! A page's fingerprint hashes its element skeleton only: for each element in
//! document order, its depth, lowercase tag name and sorted attribute names.
//! Text, attribute values and comments are left out, so content churn does
//! not register as drift while added, removed, re-nested or re-attributed
//! elements do.
//!
//! Each element contributes the line `depth:tag[attr,attr]\n`; the
//! fingerprint is the lowercase hex SHA-256 of all lines.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::models::{DiffRecord, Fingerprint, StructuralElement};
use crate::traits::{DocumentParser, FingerprintStore};

/// Which key fingerprints are stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffScope {
    /// One fingerprint per target key (URL authority).
    #[default]
    Target,
    /// One fingerprint per full URL.
    Url,
}

impl FromStr for DiffScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "target" => Ok(DiffScope::Target),
            "url" => Ok(DiffScope::Url),
            _ => Err(format!("Unknown diff scope: {}", s)),
        }
    }
}

/// Compute the structural fingerprint of an element list.
pub fn fingerprint(elements: &[StructuralElement]) -> Fingerprint {
    let mut hasher = Sha256::new();
    for element in elements {
        hasher.update(skeleton_line(element).as_bytes());
    }
    Fingerprint::new(format!("{:x}", hasher.finalize()))
}

fn skeleton_line(element: &StructuralElement) -> String {
    let attributes: Vec<&str> = element.attributes.iter().map(String::as_str).collect();
    format!(
        "{}:{}[{}]\n",
        element.depth,
        element.tag,
        attributes.join(",")
    )
}

/// Fingerprints successful bodies and compares them with the stored baseline.
#[derive(Clone)]
pub struct DiffWatcher<P, S>
where
    P: DocumentParser,
    S: FingerprintStore,
{
    parser: P,
    store: S,
    scope: DiffScope,
    /// Serialises read-modify-write per key.
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl<P, S> DiffWatcher<P, S>
where
    P: DocumentParser,
    S: FingerprintStore,
{
    pub fn new(parser: P, store: S) -> Self {
        Self {
            parser,
            store,
            scope: DiffScope::default(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_scope(mut self, scope: DiffScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn scope(&self) -> DiffScope {
        self.scope
    }

    /// The store key for a fetched URL under the configured scope.
    pub fn key_for<'a>(&self, url: &'a str, target_key: &'a str) -> &'a str {
        match self.scope {
            DiffScope::Target => target_key,
            DiffScope::Url => url,
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Fingerprint `body`, compare with the stored fingerprint for `key` and
    /// store the new one.
    ///
    /// The stored fingerprint is always replaced, so the next comparison is
    /// against the latest structure rather than the first baseline.
    pub async fn observe(&self, key: &str, body: &str) -> Result<DiffRecord, AppError> {
        let elements = self.parser.parse(body)?;
        let current = fingerprint(&elements);

        let key_lock = self.key_lock(key).await;
        let _guard = key_lock.lock().await;

        let previous = self.store.get(key).await?;
        self.store.put(key, &current).await?;

        let changed = previous.as_ref().is_some_and(|prev| prev != &current);
        match &previous {
            None => {
                tracing::info!(%key, fingerprint = %current.short(), "Recorded structural baseline");
            }
            Some(prev) if changed => {
                tracing::warn!(
                    %key,
                    previous = %prev.short(),
                    current = %current.short(),
                    elements = elements.len(),
                    "Structural drift detected, selectors may be unreliable"
                );
            }
            Some(_) => {
                tracing::debug!(%key, "Structure unchanged");
            }
        }

        Ok(DiffRecord {
            key: key.to_string(),
            previous,
            current,
            observed_at: Utc::now(),
            changed,
        })
    }
}
