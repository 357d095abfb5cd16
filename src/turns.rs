//! Registry of active and recently completed turns.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::{Turn, TurnStatus};

/// Shared map of turns keyed by id.
///
/// The pipeline mutates entries as a turn progresses; `/api/response/{id}`
/// reads them. Acknowledged turns are removed once their artifact is gone.
pub struct TurnStore {
    inner: RwLock<HashMap<String, Turn>>,
}

impl TurnStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
        })
    }

    pub async fn insert(&self, turn: Turn) {
        self.inner.write().await.insert(turn.id.clone(), turn);
    }

    pub async fn get(&self, id: &str) -> Option<Turn> {
        self.inner.read().await.get(id).cloned()
    }

    /// Apply a mutation to a turn in place. Returns false when unknown.
    pub async fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Turn),
    {
        let mut map = self.inner.write().await;
        match map.get_mut(id) {
            Some(turn) => {
                f(turn);
                true
            }
            None => false,
        }
    }

    /// Discard a turn entirely, e.g. a duplicate rejected after intake.
    pub async fn remove(&self, id: &str) -> Option<Turn> {
        self.inner.write().await.remove(id)
    }

    /// Mark a turn acknowledged and remove it from the registry, returning
    /// its final state so the caller can release the artifact.
    pub async fn acknowledge(&self, id: &str) -> Option<Turn> {
        let mut map = self.inner.write().await;
        let turn = map.get_mut(id)?;
        turn.acknowledged = true;
        map.remove(id)
    }

    /// Force every unfinished turn into the given terminal status.
    /// Returns the affected ids.
    pub async fn finish_unresolved(&self, status: TurnStatus) -> Vec<String> {
        let mut map = self.inner.write().await;
        let mut affected = Vec::new();
        for (id, turn) in map.iter_mut() {
            if matches!(turn.status, TurnStatus::Pending) {
                turn.status = status;
                affected.push(id.clone());
            }
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Origin, ResponseMode};

    #[tokio::test]
    async fn test_insert_update_get() {
        let store = TurnStore::new();
        let turn = Turn::new(Origin::Text, ResponseMode::Text);
        let id = turn.id.clone();
        store.insert(turn).await;

        assert!(
            store
                .update(&id, |t| {
                    t.status = TurnStatus::Completed;
                    t.response_text = Some("done".to_string());
                })
                .await
        );

        let turn = store.get(&id).await.unwrap();
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.response_text.as_deref(), Some("done"));
        assert!(!store.update("no-such-turn", |_| {}).await);
    }

    #[tokio::test]
    async fn test_acknowledge_removes() {
        let store = TurnStore::new();
        let turn = Turn::new(Origin::Voice, ResponseMode::Audio);
        let id = turn.id.clone();
        store.insert(turn).await;

        let acked = store.acknowledge(&id).await.unwrap();
        assert!(acked.acknowledged);
        assert!(store.get(&id).await.is_none());
        assert!(store.acknowledge(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_finish_unresolved_only_touches_pending() {
        let store = TurnStore::new();
        let pending = Turn::new(Origin::Text, ResponseMode::Text);
        let pending_id = pending.id.clone();
        let mut done = Turn::new(Origin::Text, ResponseMode::Text);
        done.status = TurnStatus::Completed;
        let done_id = done.id.clone();
        store.insert(pending).await;
        store.insert(done).await;

        let affected = store.finish_unresolved(TurnStatus::Failed).await;
        assert_eq!(affected, vec![pending_id.clone()]);
        assert_eq!(store.get(&pending_id).await.unwrap().status, TurnStatus::Failed);
        assert_eq!(store.get(&done_id).await.unwrap().status, TurnStatus::Completed);
    }
}
