//! Redis-backed state store for cross-process visibility

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use crate::model::{ExecutionId, ExecutionStatus};

use super::{ExecutionProgress, StateStore, StateStoreError};

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL
    pub redis_url: String,
    /// Prefix applied to every key
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            key_prefix: "dagflow:".to_string(),
        }
    }
}

/// [`StateStore`] over Redis.
///
/// Each execution owns a status hash plus two sets of node keys, all under
/// `{prefix}exec:{id}:`. The TTL is refreshed on every write so the entry
/// survives for the configured window after the last touch.
pub struct RedisStateStore {
    connection: ConnectionManager,
    config: RedisConfig,
}

fn backend(err: impl std::fmt::Display) -> StateStoreError {
    StateStoreError::Backend(err.to_string())
}

impl RedisStateStore {
    /// Connect to Redis.
    pub async fn new(config: RedisConfig) -> Result<Self, StateStoreError> {
        let client = Client::open(config.redis_url.as_str()).map_err(backend)?;
        let connection = ConnectionManager::new(client).await.map_err(backend)?;
        Ok(Self { connection, config })
    }

    fn state_key(&self, execution_id: ExecutionId) -> String {
        format!("{}exec:{}:state", self.config.key_prefix, execution_id)
    }

    fn completed_key(&self, execution_id: ExecutionId) -> String {
        format!("{}exec:{}:completed", self.config.key_prefix, execution_id)
    }

    fn failed_key(&self, execution_id: ExecutionId) -> String {
        format!("{}exec:{}:failed", self.config.key_prefix, execution_id)
    }

    async fn add_member(
        &self,
        set_key: String,
        state_key: String,
        node_key: &str,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.connection.clone();
        // Entry gone (expired or cleared): drop the write rather than
        // resurrecting a keyless set.
        let exists: bool = conn.exists(&state_key).await.map_err(backend)?;
        if !exists {
            return Ok(());
        }
        let ttl: i64 = conn.ttl(&state_key).await.map_err(backend)?;
        let mut pipe = redis::pipe();
        pipe.sadd(&set_key, node_key);
        if ttl > 0 {
            pipe.expire(&set_key, ttl);
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn init(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
        ttl: Duration,
    ) -> Result<(), StateStoreError> {
        // A cancel that raced dispatch must survive the init.
        let pre_cancelled =
            self.status_flag(execution_id).await? == Some(ExecutionStatus::Cancelled);
        let effective = if pre_cancelled {
            ExecutionStatus::Cancelled
        } else {
            status
        };

        let mut conn = self.connection.clone();
        let state_key = self.state_key(execution_id);
        let mut pipe = redis::pipe();
        pipe.del(&state_key)
            .del(self.completed_key(execution_id))
            .del(self.failed_key(execution_id))
            .hset(&state_key, "status", effective.to_string())
            .expire(&state_key, ttl.as_secs() as i64);
        pipe.query_async::<()>(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn set_status_flag(
        &self,
        execution_id: ExecutionId,
        status: ExecutionStatus,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.connection.clone();
        let state_key = self.state_key(execution_id);
        let exists: bool = conn.exists(&state_key).await.map_err(backend)?;
        let mut pipe = redis::pipe();
        pipe.hset(&state_key, "status", status.to_string());
        if !exists {
            // HSET creates the hash; give it the default lifetime.
            pipe.expire(&state_key, super::DEFAULT_STATE_TTL.as_secs() as i64);
        }
        pipe.query_async::<()>(&mut conn).await.map_err(backend)?;
        Ok(())
    }

    async fn status_flag(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionStatus>, StateStoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn
            .hget(self.state_key(execution_id), "status")
            .await
            .map_err(backend)?;
        raw.map(|s| s.parse().map_err(StateStoreError::Backend))
            .transpose()
    }

    async fn add_completed(
        &self,
        execution_id: ExecutionId,
        node_key: &str,
    ) -> Result<(), StateStoreError> {
        self.add_member(
            self.completed_key(execution_id),
            self.state_key(execution_id),
            node_key,
        )
        .await
    }

    async fn add_failed(
        &self,
        execution_id: ExecutionId,
        node_key: &str,
    ) -> Result<(), StateStoreError> {
        self.add_member(
            self.failed_key(execution_id),
            self.state_key(execution_id),
            node_key,
        )
        .await
    }

    async fn snapshot(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Option<ExecutionProgress>, StateStoreError> {
        let Some(status) = self.status_flag(execution_id).await? else {
            return Ok(None);
        };
        let mut conn = self.connection.clone();
        let completed: BTreeSet<String> = conn
            .smembers(self.completed_key(execution_id))
            .await
            .map_err(backend)?;
        let failed: BTreeSet<String> = conn
            .smembers(self.failed_key(execution_id))
            .await
            .map_err(backend)?;
        Ok(Some(ExecutionProgress {
            status,
            completed_keys: completed,
            failed_keys: failed,
        }))
    }

    async fn clear(&self, execution_id: ExecutionId) -> Result<(), StateStoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(&[
                self.state_key(execution_id),
                self.completed_key(execution_id),
                self.failed_key(execution_id),
            ])
            .await
            .map_err(backend)?;
        Ok(())
    }
}
