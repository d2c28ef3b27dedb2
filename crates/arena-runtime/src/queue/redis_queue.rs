//! Shared-store work queue for multi-pod jobs.
//!
//! Layout per job (the job ID is a hash tag so every key of a job lands in
//! one cluster slot):
//!
//! ```text
//! {prefix}:{job}:items      hash  id -> item metadata (JSON, no result)
//! {prefix}:{job}:results    hash  id -> raw result bytes
//! {prefix}:{job}:pending    list  ids, FIFO
//! {prefix}:{job}:inflight   set   claimed ids
//! {prefix}:{job}:completed  list  ids, in ack order
//! {prefix}:{job}:failed     list  ids, in failure order
//! ```
//!
//! Claiming and settling run as server-side scripts. Membership in
//! `inflight` is the claim: only the caller whose script removes an id from
//! that set may settle it.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{IntoConnectionInfo, Script};
use std::time::Duration;

use arena_core::{ItemStatus, NackOutcome, TransitionError, WorkItem};

use super::{as_pending, validate_new_items, JobProgress, QueueError, WorkQueue, LEASE_EXPIRED};
use crate::config::RedisConfig;

/// KEYS: items, pending. ARGV: id, json, id, json, ...
/// Returns the first ID already present, or nil after enqueuing everything.
const PUSH_SCRIPT: &str = r#"
for i = 1, #ARGV, 2 do
  if redis.call('HEXISTS', KEYS[1], ARGV[i]) == 1 then
    return ARGV[i]
  end
end
for i = 1, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  redis.call('RPUSH', KEYS[2], ARGV[i])
end
return false
"#;

/// KEYS: pending, inflight, items. ARGV: startedAt.
/// Pops the oldest pending id, marks it in flight and starts its attempt.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if not id then
  return false
end
local raw = redis.call('HGET', KEYS[3], id)
if not raw then
  return redis.error_reply('work item ' .. id .. ' has no metadata')
end
local item = cjson.decode(raw)
item.status = 'in_progress'
item.attempts = (tonumber(item.attempts) or 0) + 1
item.startedAt = ARGV[1]
local encoded = cjson.encode(item)
redis.call('HSET', KEYS[3], id, encoded)
redis.call('SADD', KEYS[2], id)
return encoded
"#;

/// KEYS: items, inflight, destination list, [results].
/// ARGV: id, json, [result].
/// Returns 0 when the id is no longer in flight.
const SETTLE_SCRIPT: &str = r#"
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
if KEYS[4] then
  redis.call('HSET', KEYS[4], ARGV[1], ARGV[3])
end
redis.call('RPUSH', KEYS[3], ARGV[1])
return 1
"#;

/// Keys of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JobKeys {
    items: String,
    results: String,
    pending: String,
    inflight: String,
    completed: String,
    failed: String,
}

impl JobKeys {
    pub(crate) fn new(prefix: &str, job_id: &str) -> Self {
        let base = format!("{}:{{{}}}", prefix, job_id);
        Self {
            items: format!("{}:items", base),
            results: format!("{}:results", base),
            pending: format!("{}:pending", base),
            inflight: format!("{}:inflight", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
        }
    }

    fn all(&self) -> [&str; 6] {
        [
            &self.items,
            &self.results,
            &self.pending,
            &self.inflight,
            &self.completed,
            &self.failed,
        ]
    }
}

/// Work queue backed by a shared Redis instance.
pub struct RedisQueue {
    conn: ConnectionManager,
    prefix: String,
    max_retries: u32,
    job_ttl: Option<Duration>,
    push_script: Script,
    claim_script: Script,
    settle_script: Script,
}

impl RedisQueue {
    /// Connect, retrying with exponential backoff.
    pub async fn connect(config: &RedisConfig, max_retries: u32) -> Result<Self, QueueError> {
        let mut info = config.url.as_str().into_connection_info()?;
        if let Some(password) = config.password() {
            info.redis.password = Some(password.to_string());
        }
        if config.db != 0 {
            info.redis.db = config.db;
        }
        let addr = format!("{:?}", info.addr);
        let client = redis::Client::open(info)?;

        let conn = (|| client.get_connection_manager())
            .retry(ExponentialBuilder::default().with_max_times(config.connect_retries))
            .notify(|e: &redis::RedisError, retry_in: Duration| {
                tracing::warn!(error = %e, retry_in = ?retry_in, "Redis connection failed, retrying");
            })
            .await?;

        tracing::info!(
            addr = %addr,
            db = config.db,
            prefix = %config.key_prefix,
            max_retries,
            "Connected to Redis work queue"
        );

        Ok(Self::from_connection(conn, config, max_retries))
    }

    /// Wrap an existing connection.
    pub fn from_connection(conn: ConnectionManager, config: &RedisConfig, max_retries: u32) -> Self {
        Self {
            conn,
            prefix: config.key_prefix.clone(),
            max_retries,
            job_ttl: config.job_ttl,
            push_script: Script::new(PUSH_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        }
    }

    fn keys(&self, job_id: &str) -> JobKeys {
        JobKeys::new(&self.prefix, job_id)
    }

    async fn job_exists(&self, keys: &JobKeys) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(&keys.items)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn refresh_ttl(&self, keys: &JobKeys) -> Result<(), QueueError> {
        let Some(ttl) = self.job_ttl else {
            return Ok(());
        };
        let mut pipe = redis::pipe();
        for key in keys.all() {
            pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1)).ignore();
        }
        let mut conn = self.conn.clone();
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn load_item(&self, keys: &JobKeys, job_id: &str, item_id: &str) -> Result<WorkItem, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&keys.items)
            .arg(item_id)
            .query_async(&mut conn)
            .await?;

        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None if !self.job_exists(keys).await? => Err(QueueError::JobNotFound(job_id.to_string())),
            None => Err(QueueError::ItemNotFound {
                job_id: job_id.to_string(),
                item_id: item_id.to_string(),
            }),
        }
    }

    /// Move an in-flight item to `destination`. Returns false if another
    /// caller settled it first.
    async fn settle(
        &self,
        keys: &JobKeys,
        item: &WorkItem,
        destination: &str,
        result: Option<Vec<u8>>,
    ) -> Result<bool, QueueError> {
        let json = serde_json::to_string(item)?;
        let mut invocation = self.settle_script.prepare_invoke();
        invocation
            .key(&keys.items)
            .key(&keys.inflight)
            .key(destination)
            .arg(&item.id)
            .arg(json);
        if let Some(bytes) = result {
            invocation.key(&keys.results).arg(bytes);
        }

        let mut conn = self.conn.clone();
        let settled: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(settled == 1)
    }

    /// The item left the in-flight set under us; report its real state.
    async fn lost_race(&self, keys: &JobKeys, job_id: &str, item_id: &str, action: &'static str) -> QueueError {
        match self.load_item(keys, job_id, item_id).await {
            Ok(current) => QueueError::InvalidTransition(TransitionError {
                item_id: item_id.to_string(),
                from: current.status,
                action,
            }),
            Err(e) => e,
        }
    }

    async fn nack_item(&self, keys: &JobKeys, job_id: &str, mut item: WorkItem, error: &str) -> Result<NackOutcome, QueueError> {
        let outcome = item.fail_attempt(error, self.max_retries)?;
        let destination = match outcome {
            NackOutcome::Requeued { .. } => &keys.pending,
            NackOutcome::Failed => &keys.failed,
        };

        if !self.settle(keys, &item, destination, None).await? {
            return Err(self.lost_race(keys, job_id, &item.id, "nack").await);
        }
        Ok(outcome)
    }

    async fn terminal_items(&self, job_id: &str, list: fn(&JobKeys) -> &str) -> Result<Vec<WorkItem>, QueueError> {
        let keys = self.keys(job_id);
        let mut conn = self.conn.clone();

        let (exists, ids): (bool, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("EXISTS")
            .arg(&keys.items)
            .cmd("LRANGE")
            .arg(list(&keys))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        if !exists {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let (metadata, results): (Vec<Option<String>>, Vec<Option<Vec<u8>>>) = redis::pipe()
            .cmd("HMGET")
            .arg(&keys.items)
            .arg(&ids)
            .cmd("HMGET")
            .arg(&keys.results)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let mut items = Vec::with_capacity(ids.len());
        for ((id, raw), result) in ids.iter().zip(metadata).zip(results) {
            match raw {
                Some(json) => {
                    let mut item: WorkItem = serde_json::from_str(&json)?;
                    item.result = result.unwrap_or_default();
                    items.push(item);
                }
                None => {
                    tracing::warn!(job_id, item_id = %id, "Terminal work item has no metadata");
                    items.push(WorkItem {
                        error: Some(format!("metadata for work item '{}' is missing", id)),
                        ..Default::default()
                    });
                }
            }
        }
        Ok(items)
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn push(&self, job_id: &str, items: Vec<WorkItem>) -> Result<(), QueueError> {
        validate_new_items(&items)?;
        if items.is_empty() {
            return Ok(());
        }

        let keys = self.keys(job_id);
        let count = items.len();
        let mut invocation = self.push_script.prepare_invoke();
        invocation.key(&keys.items).key(&keys.pending);
        for item in items {
            let item = as_pending(item);
            invocation.arg(&item.id).arg(serde_json::to_string(&item)?);
        }

        let mut conn = self.conn.clone();
        let duplicate: Option<String> = invocation.invoke_async(&mut conn).await?;
        if let Some(item_id) = duplicate {
            return Err(QueueError::DuplicateItem {
                job_id: job_id.to_string(),
                item_id,
            });
        }

        self.refresh_ttl(&keys).await?;
        tracing::debug!(job_id, count, "Pushed work items");
        Ok(())
    }

    async fn pop(&self, job_id: &str) -> Result<Option<WorkItem>, QueueError> {
        let keys = self.keys(job_id);
        let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        let mut conn = self.conn.clone();
        let claimed: Option<String> = self
            .claim_script
            .key(&keys.pending)
            .key(&keys.inflight)
            .key(&keys.items)
            .arg(started_at)
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(json) => {
                // The claim may have created the inflight set
                self.refresh_ttl(&keys).await?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None if !self.job_exists(&keys).await? => Err(QueueError::JobNotFound(job_id.to_string())),
            None => Ok(None),
        }
    }

    async fn ack(&self, job_id: &str, item_id: &str, result: Vec<u8>) -> Result<(), QueueError> {
        let keys = self.keys(job_id);
        let mut item = self.load_item(&keys, job_id, item_id).await?;
        item.complete(Vec::new(), Utc::now())?;

        if !self.settle(&keys, &item, &keys.completed, Some(result)).await? {
            return Err(self.lost_race(&keys, job_id, item_id, "ack").await);
        }
        self.refresh_ttl(&keys).await?;
        Ok(())
    }

    async fn nack(&self, job_id: &str, item_id: &str, error: &str) -> Result<(), QueueError> {
        let keys = self.keys(job_id);
        let item = self.load_item(&keys, job_id, item_id).await?;

        match self.nack_item(&keys, job_id, item, error).await? {
            NackOutcome::Requeued { attempts } => {
                tracing::debug!(job_id, item_id, attempts, error, "Work item requeued");
            }
            NackOutcome::Failed => {
                tracing::warn!(job_id, item_id, error, "Work item failed, retries exhausted");
            }
        }
        self.refresh_ttl(&keys).await?;
        Ok(())
    }

    async fn get_completed_items(&self, job_id: &str) -> Result<Vec<WorkItem>, QueueError> {
        self.terminal_items(job_id, |keys| keys.completed.as_str()).await
    }

    async fn get_failed_items(&self, job_id: &str) -> Result<Vec<WorkItem>, QueueError> {
        self.terminal_items(job_id, |keys| keys.failed.as_str()).await
    }

    async fn progress(&self, job_id: &str) -> Result<JobProgress, QueueError> {
        let keys = self.keys(job_id);
        let mut conn = self.conn.clone();

        let (total, pending, in_progress, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .atomic()
                .cmd("HLEN")
                .arg(&keys.items)
                .cmd("LLEN")
                .arg(&keys.pending)
                .cmd("SCARD")
                .arg(&keys.inflight)
                .cmd("LLEN")
                .arg(&keys.completed)
                .cmd("LLEN")
                .arg(&keys.failed)
                .query_async(&mut conn)
                .await?;

        if total == 0 {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }

        Ok(JobProgress {
            total,
            pending,
            in_progress,
            completed,
            failed,
        })
    }

    async fn requeue_stale(&self, job_id: &str, lease: Duration) -> Result<usize, QueueError> {
        let keys = self.keys(job_id);
        let mut conn = self.conn.clone();

        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&keys.inflight)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let metadata: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.items)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let now = Utc::now();
        let mut reclaimed = 0;
        for raw in metadata.into_iter().flatten() {
            let item: WorkItem = serde_json::from_str(&raw)?;
            let expired = item.status == ItemStatus::InProgress
                && item
                    .started_at
                    .and_then(|started| (now - started).to_std().ok())
                    .is_some_and(|held| held > lease);
            if !expired {
                continue;
            }

            match self.nack_item(&keys, job_id, item, LEASE_EXPIRED).await {
                Ok(_) => reclaimed += 1,
                // Settled by its worker while we were scanning.
                Err(QueueError::InvalidTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if reclaimed > 0 {
            tracing::info!(job_id, reclaimed, lease = ?lease, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    fn name(&self) -> &str {
        "redis"
    }
}
