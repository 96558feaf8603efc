//! Shared status map.
//!
//! Every component writes human-readable status strings here; the admin UI
//! reads snapshots.  Purely informational: nothing inside the daemon makes
//! decisions based on these strings.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A status map key: one entry per managed device plus the well-known
/// component names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKey {
    Device(i64),
    Database,
    Processor,
    Nfcapd,
}

impl std::fmt::Display for StatusKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusKey::Device(id) => write!(f, "device:{}", id),
            StatusKey::Database => write!(f, "database"),
            StatusKey::Processor => write!(f, "processor"),
            StatusKey::Nfcapd => write!(f, "nfcapd"),
        }
    }
}

/// Concurrent status map with atomic per-key writes.
#[derive(Debug, Clone, Default)]
pub struct StatusMap {
    inner: Arc<RwLock<HashMap<StatusKey, String>>>,
}

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, key: StatusKey, text: impl Into<String>) {
        self.inner.write().await.insert(key, text.into());
    }

    pub async fn remove(&self, key: StatusKey) {
        self.inner.write().await.remove(&key);
    }

    pub async fn get(&self, key: StatusKey) -> Option<String> {
        self.inner.read().await.get(&key).cloned()
    }

    /// Snapshot for the admin UI, keyed by the display form.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_snapshot() {
        let status = StatusMap::new();
        status.set(StatusKey::Device(3), "Connected").await;
        status.set(StatusKey::Database, "Connected to pg").await;

        assert_eq!(
            status.get(StatusKey::Device(3)).await.as_deref(),
            Some("Connected")
        );
        let snap = status.snapshot().await;
        assert_eq!(snap.get("device:3").map(String::as_str), Some("Connected"));
        assert_eq!(
            snap.get("database").map(String::as_str),
            Some("Connected to pg")
        );
    }

    #[tokio::test]
    async fn remove_clears_the_key() {
        let status = StatusMap::new();
        status.set(StatusKey::Device(1), "Stopped").await;
        status.remove(StatusKey::Device(1)).await;
        assert_eq!(status.get(StatusKey::Device(1)).await, None);
    }
}
