//! Ephemeral live-execution state
//!
//! One key per execution holds the live status flag and the sets of
//! completed and failed node keys. The owning scheduler writes everything
//! except the status flag, which the cancel entrypoint may flip to
//! CANCELLED at any time. Durable truth lives in the repository; this
//! store only has to outlive the in-flight execution (24h TTL by default).

mod memory;
pub mod redis;

pub use memory::MemoryStateStore;
pub use redis::{RedisConfig, RedisStateStore};

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ExecutionId, ExecutionStatus};

/// TTL applied when a flag write has to create the entry itself.
pub const DEFAULT_STATE_TTL: Duration = Duration::from_secs(86_400);

/// Errors returned by state store implementations
#[derive(Error, Debug)]
pub enum StateStoreError {
    /// The backing store failed
    #[error("state store backend error: {0}")]
    Backend(String),
}

/// Snapshot of an execution's live state, for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProgress {
    /// Live status flag
    pub status: ExecutionStatus,
    /// Node keys that completed successfully so far
    pub completed_keys: BTreeSet<String>,
    /// Node keys that failed so far
    pub failed_keys: BTreeSet<String>,
}

/// Fast key-value store for live execution state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the execution's state entry with the given status, empty
    /// sets, and a TTL after which the entry may vanish.
    ///
    /// A CANCELLED flag already present (a cancel that raced dispatch) is
    /// preserved so the scheduler observes it at its first checkpoint.
    async fn init(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        ttl: Duration,
    ) -> Result<(), StateStoreError>;

    /// Overwrite the status flag, creating the entry if absent.
    async fn set_status_flag(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
    ) -> Result<(), StateStoreError>;

    /// Read the status flag; `None` if the entry is gone.
    async fn status_flag(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionStatus>, StateStoreError>;

    /// Add a node key to the completed set.
    async fn add_completed(
        &self,
        execution_id: ExecutionId,
        node_key: &str,
    ) -> Result<(), StateStoreError>;

    /// Add a node key to the failed set.
    async fn add_failed(
        &self,
        execution_id: ExecutionId,
        node_key: &str,
    ) -> Result<(), StateStoreError>;

    /// Read the whole entry; `None` if the entry is gone.
    async fn snapshot(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionProgress>, StateStoreError>;

    /// Delete the entry.
    async fn clear(&self, execution_id: ExecutionId) -> Result<(), StateStoreError>;
}
