//! In-memory state store for tests and embedded use

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{ExecutionId, ExecutionStatus};

use super::{ExecutionProgress, StateStore, StateStoreError};

struct Entry {
    status: ExecutionStatus,
    completed_keys: BTreeSet<String>,
    failed_keys: BTreeSet<String>,
    expires_at: Instant,
}

/// In-memory [`StateStore`] with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: DashMap<ExecutionId, Entry>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the entry if its TTL has elapsed, then run `f` on it.
    fn with_live_entry<T>(
        &self,
        execution_id: ExecutionId,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Option<T> {
        let mut entry = self.entries.get_mut(&execution_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(&execution_id);
            return None;
        }
        Some(f(&mut entry))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn init(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        ttl: Duration,
    ) -> Result<(), StateStoreError> {
        // A cancel that raced dispatch must survive the init.
        let pre_cancelled = self
            .with_live_entry(execution_id, |entry| entry.status)
            .map(|s| s == ExecutionStatus::Cancelled)
            .unwrap_or(false);
        self.entries.insert(
            execution_id,
            Entry {
                status: if pre_cancelled {
                    ExecutionStatus::Cancelled
                } else {
                    status
                },
                completed_keys: BTreeSet::new(),
                failed_keys: BTreeSet::new(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_status_flag(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
    ) -> Result<(), StateStoreError> {
        let updated = self
            .with_live_entry(execution_id, |entry| entry.status = status)
            .is_some();
        if !updated {
            self.entries.insert(
                execution_id,
                Entry {
                    status,
                    completed_keys: BTreeSet::new(),
                    failed_keys: BTreeSet::new(),
                    expires_at: Instant::now() + super::DEFAULT_STATE_TTL,
                },
            );
        }
        Ok(())
    }

    async fn status_flag(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionStatus>, StateStoreError> {
        Ok(self.with_live_entry(execution_id, |entry| entry.status))
    }

    async fn add_completed(
        &self,
        execution_id: ExecutionId,
        node_key: &str,
    ) -> Result<(), StateStoreError> {
        self.with_live_entry(execution_id, |entry| {
            entry.completed_keys.insert(node_key.to_string());
        });
        Ok(())
    }

    async fn add_failed(
        &self,
        execution_id: ExecutionId,
        node_key: &str,
    ) -> Result<(), StateStoreError> {
        self.with_live_entry(execution_id, |entry| {
            entry.failed_keys.insert(node_key.to_string());
        });
        Ok(())
    }

    async fn snapshot(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionProgress>, StateStoreError> {
        Ok(self.with_live_entry(execution_id, |entry| ExecutionProgress {
            status: entry.status,
            completed_keys: entry.completed_keys.clone(),
            failed_keys: entry.failed_keys.clone(),
        }))
    }

    async fn clear(&self, execution_id: ExecutionId) -> Result<(), StateStoreError> {
        self.entries.remove(&execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_round_trip() {
        let store = MemoryStateStore::new();
        let id = ExecutionId::new();

        store
            .init(id, ExecutionStatus::Running, Duration::from_secs(60))
            .await
            .unwrap();
        store.add_completed(id, "a").await.unwrap();
        store.add_completed(id, "a").await.unwrap();
        store.add_failed(id, "b").await.unwrap();

        let snapshot = store.snapshot(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert_eq!(snapshot.completed_keys.len(), 1);
        assert!(snapshot.failed_keys.contains("b"));

        store
            .set_status_flag(id, ExecutionStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(
            store.status_flag(id).await.unwrap(),
            Some(ExecutionStatus::Cancelled)
        );

        store.clear(id).await.unwrap();
        assert_eq!(store.snapshot(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryStateStore::new();
        let id = ExecutionId::new();
        store
            .init(id, ExecutionStatus::Running, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.status_flag(id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_flag_survives_init() {
        let store = MemoryStateStore::new();
        let id = ExecutionId::new();

        // A cancel may land before the scheduler initialises the entry.
        store
            .set_status_flag(id, ExecutionStatus::Cancelled)
            .await
            .unwrap();
        store
            .init(id, ExecutionStatus::Running, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.status_flag(id).await.unwrap(),
            Some(ExecutionStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_missing_entry_reads_as_none() {
        let store = MemoryStateStore::new();
        let id = ExecutionId::new();
        assert_eq!(store.status_flag(id).await.unwrap(), None);
        // Writes to a missing entry are silently dropped, not errors.
        store.add_completed(id, "a").await.unwrap();
        assert_eq!(store.snapshot(id).await.unwrap(), None);
    }
}
