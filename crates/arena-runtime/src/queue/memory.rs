//! In-memory work queue for tests and single-process jobs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use arena_core::{ItemStatus, NackOutcome, WorkItem};

use super::{as_pending, validate_new_items, JobProgress, QueueError, WorkQueue, LEASE_EXPIRED};

/// Items of one job, in enqueue order.
#[derive(Debug, Default)]
struct JobState {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
    /// Positions into `items`, FIFO
    pending: VecDeque<usize>,
}

impl JobState {
    fn item_mut(&mut self, job_id: &str, item_id: &str) -> Result<&mut WorkItem, QueueError> {
        let pos = *self
            .index
            .get(item_id)
            .ok_or_else(|| QueueError::ItemNotFound {
                job_id: job_id.to_string(),
                item_id: item_id.to_string(),
            })?;
        Ok(&mut self.items[pos])
    }

    fn nack_at(&mut self, pos: usize, error: &str, max_retries: u32) -> Result<NackOutcome, QueueError> {
        let outcome = self.items[pos].fail_attempt(error, max_retries)?;
        if let NackOutcome::Requeued { .. } = outcome {
            self.pending.push_back(pos);
        }
        Ok(outcome)
    }

    fn snapshot(&self, status: ItemStatus) -> Vec<WorkItem> {
        self.items
            .iter()
            .filter(|item| item.status == status)
            .cloned()
            .collect()
    }
}

/// Work queue held in process memory.
///
/// All state sits behind one mutex, so `pop` is trivially an atomic claim.
pub struct MemoryQueue {
    max_retries: u32,
    jobs: Mutex<HashMap<String, JobState>>,
}

impl MemoryQueue {
    /// Create a queue allowing `max_retries` attempts per item.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn with_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut JobState) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        f(job)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn push(&self, job_id: &str, items: Vec<WorkItem>) -> Result<(), QueueError> {
        validate_new_items(&items)?;

        let mut jobs = self.jobs.lock();
        let job = jobs.entry(job_id.to_string()).or_default();

        if let Some(dup) = items.iter().find(|i| job.index.contains_key(&i.id)) {
            return Err(QueueError::DuplicateItem {
                job_id: job_id.to_string(),
                item_id: dup.id.clone(),
            });
        }

        let count = items.len();
        for item in items {
            let pos = job.items.len();
            job.index.insert(item.id.clone(), pos);
            job.items.push(as_pending(item));
            job.pending.push_back(pos);
        }

        tracing::debug!(job_id, count, "Pushed work items");
        Ok(())
    }

    async fn pop(&self, job_id: &str) -> Result<Option<WorkItem>, QueueError> {
        self.with_job(job_id, |job| {
            let Some(pos) = job.pending.pop_front() else {
                return Ok(None);
            };
            let item = &mut job.items[pos];
            item.claim(Utc::now())?;
            Ok(Some(item.clone()))
        })
    }

    async fn ack(&self, job_id: &str, item_id: &str, result: Vec<u8>) -> Result<(), QueueError> {
        self.with_job(job_id, |job| {
            job.item_mut(job_id, item_id)?
                .complete(result, Utc::now())?;
            Ok(())
        })
    }

    async fn nack(&self, job_id: &str, item_id: &str, error: &str) -> Result<(), QueueError> {
        let max_retries = self.max_retries;
        let outcome = self.with_job(job_id, |job| {
            let pos = job.index.get(item_id).copied().ok_or_else(|| QueueError::ItemNotFound {
                job_id: job_id.to_string(),
                item_id: item_id.to_string(),
            })?;
            job.nack_at(pos, error, max_retries)
        })?;

        match outcome {
            NackOutcome::Requeued { attempts } => {
                tracing::debug!(job_id, item_id, attempts, error, "Work item requeued");
            }
            NackOutcome::Failed => {
                tracing::warn!(job_id, item_id, error, "Work item failed, retries exhausted");
            }
        }
        Ok(())
    }

    async fn get_completed_items(&self, job_id: &str) -> Result<Vec<WorkItem>, QueueError> {
        self.with_job(job_id, |job| Ok(job.snapshot(ItemStatus::Completed)))
    }

    async fn get_failed_items(&self, job_id: &str) -> Result<Vec<WorkItem>, QueueError> {
        self.with_job(job_id, |job| Ok(job.snapshot(ItemStatus::Failed)))
    }

    async fn progress(&self, job_id: &str) -> Result<JobProgress, QueueError> {
        self.with_job(job_id, |job| {
            let mut progress = JobProgress {
                total: job.items.len() as u64,
                ..Default::default()
            };
            for item in &job.items {
                match item.status {
                    ItemStatus::Pending => progress.pending += 1,
                    ItemStatus::InProgress => progress.in_progress += 1,
                    ItemStatus::Completed => progress.completed += 1,
                    ItemStatus::Failed => progress.failed += 1,
                }
            }
            Ok(progress)
        })
    }

    async fn requeue_stale(&self, job_id: &str, lease: Duration) -> Result<usize, QueueError> {
        let max_retries = self.max_retries;
        let now = Utc::now();

        let reclaimed = self.with_job(job_id, |job| {
            let stale: Vec<usize> = job
                .items
                .iter()
                .enumerate()
                .filter(|(_, item)| {
                    item.status == ItemStatus::InProgress
                        && item
                            .started_at
                            .and_then(|started| (now - started).to_std().ok())
                            .is_some_and(|held| held > lease)
                })
                .map(|(pos, _)| pos)
                .collect();

            for &pos in &stale {
                job.nack_at(pos, LEASE_EXPIRED, max_retries)?;
            }
            Ok(stale.len())
        })?;

        if reclaimed > 0 {
            tracing::info!(job_id, reclaimed, lease = ?lease, "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
