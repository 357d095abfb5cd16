//! Write-once store of synthesized audio artifacts.
//!
//! Artifacts are keyed by turn id, served once over HTTP, and reclaimed
//! when the originating turn is acknowledged or their TTL expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

/// Store errors.
#[derive(Debug, thiserror::Error)]
pub enum AudioStoreError {
    #[error("artifact {0} already exists")]
    Conflict(String),
}

struct StoredArtifact {
    bytes: Vec<u8>,
    mime: String,
    created_at: Instant,
}

/// Keyed map of TTS audio bytes with a background reaper.
pub struct AudioStore {
    inner: RwLock<HashMap<String, StoredArtifact>>,
    ttl: Duration,
}

impl AudioStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        })
    }

    /// Insert an artifact. Write-once: a second put for the same id fails.
    pub async fn put(&self, id: &str, bytes: Vec<u8>, mime: &str) -> Result<(), AudioStoreError> {
        let mut map = self.inner.write().await;
        if map.contains_key(id) {
            return Err(AudioStoreError::Conflict(id.to_string()));
        }
        map.insert(
            id.to_string(),
            StoredArtifact {
                bytes,
                mime: mime.to_string(),
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<(Vec<u8>, String)> {
        let map = self.inner.read().await;
        map.get(id).map(|a| (a.bytes.clone(), a.mime.clone()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.contains_key(id)
    }

    /// Remove an artifact, returning whether it existed.
    pub async fn drop_artifact(&self, id: &str) -> bool {
        let removed = self.inner.write().await.remove(id).is_some();
        if removed {
            debug!("dropped audio artifact {}", id);
        }
        removed
    }

    /// Drop artifacts older than the TTL. Returns how many were removed.
    pub async fn reap_expired(&self) -> usize {
        let mut map = self.inner.write().await;
        let before = map.len();
        map.retain(|_, a| a.created_at.elapsed() < self.ttl);
        before - map.len()
    }

    /// Background reaper loop, terminated by the shutdown channel.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = self.reap_expired().await;
                    if reaped > 0 {
                        info!("reaped {} expired audio artifacts", reaped);
                    }
                }
                _ = shutdown.recv() => {
                    debug!("audio reaper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_drop() {
        let store = AudioStore::new(Duration::from_secs(600));
        store.put("t1", vec![1, 2, 3], "audio/mpeg").await.unwrap();

        let (bytes, mime) = store.get("t1").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime, "audio/mpeg");

        assert!(store.drop_artifact("t1").await);
        assert!(store.get("t1").await.is_none());
        assert!(!store.drop_artifact("t1").await);
    }

    #[tokio::test]
    async fn test_put_is_write_once() {
        let store = AudioStore::new(Duration::from_secs(600));
        store.put("t1", vec![1], "audio/mpeg").await.unwrap();
        match store.put("t1", vec![2], "audio/mpeg").await {
            Err(AudioStoreError::Conflict(id)) => assert_eq!(id, "t1"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reap_expired() {
        let store = AudioStore::new(Duration::from_millis(1));
        store.put("old", vec![1], "audio/mpeg").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.reap_expired().await, 1);
        assert!(!store.contains("old").await);
    }
}
