//! Integration tests for the Redis state store.
//!
//! These need a live Redis instance; run with
//! `REDIS_URL=redis://... cargo test -- --ignored`.

use std::env;
use std::time::Duration;

use dagflow::state_store::{RedisConfig, RedisStateStore, StateStore};
use dagflow::{ExecutionId, ExecutionStatus};

fn config() -> RedisConfig {
    RedisConfig {
        redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
        key_prefix: "dagflow-test:".to_string(),
    }
}

#[tokio::test]
#[ignore = "requires a live Redis instance"]
async fn test_state_round_trip() {
    let store = RedisStateStore::new(config())
        .await
        .expect("failed to connect to Redis");
    let execution_id = ExecutionId::new();

    store
        .init(execution_id, ExecutionStatus::Running, Duration::from_secs(60))
        .await
        .unwrap();
    store.add_completed(execution_id, "extract").await.unwrap();
    store.add_completed(execution_id, "extract").await.unwrap();
    store.add_failed(execution_id, "load").await.unwrap();

    let snapshot = store.snapshot(execution_id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Running);
    assert_eq!(snapshot.completed_keys.len(), 1);
    assert!(snapshot.completed_keys.contains("extract"));
    assert!(snapshot.failed_keys.contains("load"));

    store.clear(execution_id).await.unwrap();
    assert_eq!(store.snapshot(execution_id).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires a live Redis instance"]
async fn test_cancel_flag_survives_init() {
    let store = RedisStateStore::new(config())
        .await
        .expect("failed to connect to Redis");
    let execution_id = ExecutionId::new();

    // A cancel may land before the scheduler initialises the entry.
    store
        .set_status_flag(execution_id, ExecutionStatus::Cancelled)
        .await
        .unwrap();
    store
        .init(execution_id, ExecutionStatus::Running, Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(
        store.status_flag(execution_id).await.unwrap(),
        Some(ExecutionStatus::Cancelled)
    );
    store.clear(execution_id).await.unwrap();
}
