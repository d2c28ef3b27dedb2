//! Work queue abstraction.
//!
//! A queue owns the lifecycle of every work item in a job. Workers claim
//! items with [`WorkQueue::pop`] and report back with [`WorkQueue::ack`] or
//! [`WorkQueue::nack`]; the aggregator only ever reads terminal snapshots.
//!
//! Backends are selected at construction time and injected as
//! `Arc<dyn WorkQueue>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use arena_core::{TransitionError, WorkItem};

use crate::config::{QueueBackendConfig, QueueConfig};

mod memory;
#[cfg(feature = "redis")]
mod redis_queue;

pub use memory::MemoryQueue;
#[cfg(feature = "redis")]
pub use redis_queue::RedisQueue;

/// Error recorded when a claimed item's lease runs out.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Errors from queue backends.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Work item '{item_id}' not found in job '{job_id}'")]
    ItemNotFound { job_id: String, item_id: String },

    #[error("Duplicate work item '{item_id}' in job '{job_id}'")]
    DuplicateItem { job_id: String, item_id: String },

    #[error("Invalid work item: {0}")]
    InvalidItem(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Backend not available: {0}")]
    NotConfigured(String),
}

/// Item counts for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobProgress {
    /// Every item has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed + self.failed == self.total
    }
}

/// Durable task queue keyed by job ID.
///
/// # Contract
/// - `pop` is an atomic claim: two concurrent callers never receive the
///   same item. `Ok(None)` means no pending item is available.
/// - A `Completed` or `Failed` item never transitions again.
/// - `get_completed_items` / `get_failed_items` are read-only snapshots and
///   may run concurrently with worker traffic.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue items as Pending, creating the job if needed.
    async fn push(&self, job_id: &str, items: Vec<WorkItem>) -> Result<(), QueueError>;

    /// Claim the oldest Pending item.
    async fn pop(&self, job_id: &str) -> Result<Option<WorkItem>, QueueError>;

    /// Finalize an InProgress item as Completed with its raw result.
    async fn ack(&self, job_id: &str, item_id: &str, result: Vec<u8>) -> Result<(), QueueError>;

    /// Report a failed attempt; the item is retried or finalized as Failed.
    async fn nack(&self, job_id: &str, item_id: &str, error: &str) -> Result<(), QueueError>;

    /// Snapshot of Completed items.
    async fn get_completed_items(&self, job_id: &str) -> Result<Vec<WorkItem>, QueueError>;

    /// Snapshot of Failed items.
    async fn get_failed_items(&self, job_id: &str) -> Result<Vec<WorkItem>, QueueError>;

    /// Item counts per state.
    async fn progress(&self, job_id: &str) -> Result<JobProgress, QueueError>;

    /// Nack every InProgress item claimed longer than `lease` ago.
    ///
    /// Returns the number of items reclaimed.
    async fn requeue_stale(&self, job_id: &str, lease: Duration) -> Result<usize, QueueError>;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

/// Build the queue backend named by the configuration.
pub async fn connect_queue(config: &QueueConfig) -> Result<Arc<dyn WorkQueue>, QueueError> {
    match &config.backend {
        QueueBackendConfig::Memory => {
            tracing::info!(max_retries = config.max_retries, "Using in-memory work queue");
            Ok(Arc::new(MemoryQueue::new(config.max_retries)))
        }
        #[cfg(feature = "redis")]
        QueueBackendConfig::Redis(redis) => {
            let queue = RedisQueue::connect(redis, config.max_retries).await?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        QueueBackendConfig::Redis(_) => Err(QueueError::NotConfigured(
            "built without the 'redis' feature".to_string(),
        )),
    }
}

/// Shared validation for `push`.
pub(crate) fn validate_new_items(items: &[WorkItem]) -> Result<(), QueueError> {
    let mut seen = std::collections::HashSet::new();
    for item in items {
        if item.id.is_empty() {
            return Err(QueueError::InvalidItem("work item ID must not be empty".to_string()));
        }
        if !seen.insert(item.id.as_str()) {
            return Err(QueueError::InvalidItem(format!(
                "work item ID '{}' appears more than once",
                item.id
            )));
        }
    }
    Ok(())
}

/// Reset caller-supplied state so every pushed item starts fresh.
pub(crate) fn as_pending(mut item: WorkItem) -> WorkItem {
    item.status = arena_core::ItemStatus::Pending;
    item.result.clear();
    item.error = None;
    item.started_at = None;
    item.completed_at = None;
    item.attempts = 0;
    item
}
