//! Job-level aggregation over a work queue.
//!
//! The aggregator is read-only with respect to the queue: it snapshots the
//! terminal items of a job and folds them into an [`AggregatedResult`].
//! Running it repeatedly while workers are still draining yields a partial
//! but consistent report; after completion it is deterministic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use arena_core::{parse_with_format, to_job_result, AggregatedResult, Aggregation, JobResult, WorkItem};

use crate::config::AggregatorConfig;
use crate::queue::{QueueError, WorkQueue};

/// Errors that abort an aggregation run. No partial report is produced.
#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Failed to read {what} items for job '{job_id}': {source}")]
    QueueRead {
        job_id: String,
        what: &'static str,
        #[source]
        source: QueueError,
    },

    #[error("Reading {what} items for job '{job_id}' timed out after {after:?}")]
    Timeout {
        job_id: String,
        what: &'static str,
        after: Duration,
    },
}

/// Builds job reports from a queue backend.
pub struct Aggregator {
    queue: Arc<dyn WorkQueue>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(queue: Arc<dyn WorkQueue>, config: AggregatorConfig) -> Self {
        Self { queue, config }
    }

    /// Aggregate every terminal item of `job_id`.
    pub async fn aggregate(&self, job_id: &str) -> Result<AggregatedResult, AggregateError> {
        let completed = self
            .read(job_id, "completed", self.queue.get_completed_items(job_id))
            .await?;
        let failed = self
            .read(job_id, "failed", self.queue.get_failed_items(job_id))
            .await?;

        let mut aggregation = Aggregation::new();
        for item in completed.iter().chain(failed.iter()) {
            self.fold(&mut aggregation, item);
        }
        let report = aggregation.finish();

        tracing::info!(
            job_id,
            backend = self.queue.name(),
            total = report.total_items,
            passed = report.passed_items,
            failed = report.failed_items,
            pass_rate = report.pass_rate,
            "Aggregated job results"
        );

        Ok(report)
    }

    /// Aggregate and flatten into the persisted summary map.
    pub async fn job_result(&self, job_id: &str) -> Result<JobResult, AggregateError> {
        let report = self.aggregate(job_id).await?;
        // to_job_result only returns None for a missing report
        Ok(to_job_result(Some(&report)).unwrap_or_default())
    }

    fn fold(&self, aggregation: &mut Aggregation, item: &WorkItem) {
        match parse_with_format(item, self.config.output_format) {
            Ok(result) => aggregation.add_result(&result),
            Err(e) => {
                tracing::warn!(
                    work_item = %item.id,
                    status = %item.status,
                    error = %e,
                    "Unparseable work item counted as failed"
                );
                aggregation.add_unparsed(item);
            }
        }
    }

    async fn read<F>(&self, job_id: &str, what: &'static str, fut: F) -> Result<Vec<WorkItem>, AggregateError>
    where
        F: Future<Output = Result<Vec<WorkItem>, QueueError>>,
    {
        let after = self.config.read_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(items)) => {
                tracing::debug!(job_id, what, count = items.len(), "Read terminal items");
                Ok(items)
            }
            Ok(Err(source)) => {
                tracing::warn!(job_id, what, error = %source, "Queue read failed");
                Err(AggregateError::QueueRead {
                    job_id: job_id.to_string(),
                    what,
                    source,
                })
            }
            Err(_) => {
                tracing::warn!(job_id, what, timeout = ?after, "Queue read timed out");
                Err(AggregateError::Timeout {
                    job_id: job_id.to_string(),
                    what,
                    after,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobProgress, MemoryQueue};
    use arena_core::OutputFormat;
    use async_trait::async_trait;

    async fn drain(queue: &MemoryQueue, job_id: &str, payload: &[u8]) {
        while let Some(item) = queue.pop(job_id).await.unwrap() {
            queue.ack(job_id, &item.id, payload.to_vec()).await.unwrap();
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(format!("item-{}", i), "scenario-1", "provider-1"))
            .collect()
    }

    fn aggregator(queue: Arc<dyn WorkQueue>) -> Aggregator {
        Aggregator::new(queue, AggregatorConfig::default())
    }

    #[tokio::test]
    async fn test_no_terminal_items() {
        let queue = Arc::new(MemoryQueue::new(3));
        queue.push("job", items(1)).await.unwrap();

        let report = aggregator(queue).aggregate("job").await.unwrap();
        assert_eq!(report.total_items, 0);
        assert_eq!(report.pass_rate, 0.0);
        assert!(report.by_scenario.is_none());
        assert!(report.errors.is_none());
    }

    #[tokio::test]
    async fn test_all_pass_with_metrics() {
        let queue = Arc::new(MemoryQueue::new(3));
        queue.push("job", items(3)).await.unwrap();
        drain(
            &queue,
            "job",
            br#"{"status":"pass","durationMs":100,"metrics":{"tokens":50,"cost":0.01}}"#,
        )
        .await;

        let report = aggregator(queue).aggregate("job").await.unwrap();
        assert_eq!(report.total_items, 3);
        assert_eq!(report.passed_items, 3);
        assert_eq!(report.pass_rate, 100.0);
        assert_eq!(report.total_tokens, 150);
        assert!((report.total_cost - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mixed_pass_and_fail() {
        let queue = Arc::new(MemoryQueue::new(1));
        queue.push("job", items(4)).await.unwrap();

        let first = queue.pop("job").await.unwrap().unwrap();
        queue.nack("job", &first.id, "provider error").await.unwrap();
        drain(&queue, "job", br#"{"status":"pass"}"#).await;

        let report = aggregator(queue).aggregate("job").await.unwrap();
        assert_eq!(report.total_items, 4);
        assert_eq!(report.passed_items, 3);
        assert_eq!(report.failed_items, 1);
        assert_eq!(report.pass_rate, 75.0);
    }

    #[tokio::test]
    async fn test_groups_by_scenario() {
        let queue = Arc::new(MemoryQueue::new(3));
        queue
            .push(
                "job",
                vec![
                    WorkItem::new("1", "scenario-a", "p"),
                    WorkItem::new("2", "scenario-a", "p"),
                    WorkItem::new("3", "scenario-b", "p"),
                ],
            )
            .await
            .unwrap();
        drain(&queue, "job", br#"{"status":"pass"}"#).await;

        let report = aggregator(queue).aggregate("job").await.unwrap();
        let scenarios = report.by_scenario.unwrap();
        assert_eq!(scenarios["scenario-a"].total, 2);
        assert_eq!(scenarios["scenario-a"].pass_rate, 100.0);
        assert_eq!(scenarios["scenario-b"].total, 1);
        assert_eq!(report.by_provider.unwrap()["p"].total, 3);
    }

    #[tokio::test]
    async fn test_identical_errors_grouped() {
        let queue = Arc::new(MemoryQueue::new(1));
        queue.push("job", items(3)).await.unwrap();
        while let Some(item) = queue.pop("job").await.unwrap() {
            queue.nack("job", &item.id, "connection timeout").await.unwrap();
        }

        let report = aggregator(queue).aggregate("job").await.unwrap();
        let errors = report.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "connection timeout");
        assert_eq!(errors[0].count, 3);
        assert_eq!(errors[0].work_item_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_repeat_runs_are_identical() {
        let queue = Arc::new(MemoryQueue::new(1));
        queue.push("job", items(5)).await.unwrap();
        let first = queue.pop("job").await.unwrap().unwrap();
        queue.nack("job", &first.id, "boom").await.unwrap();
        drain(&queue, "job", br#"{"status":"fail","error":"wrong answer"}"#).await;

        let aggregator = aggregator(queue);
        let a = serde_json::to_vec(&aggregator.aggregate("job").await.unwrap()).unwrap();
        let b = serde_json::to_vec(&aggregator.aggregate("job").await.unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_junit_output_format() {
        let queue = Arc::new(MemoryQueue::new(3));
        queue.push("job", items(1)).await.unwrap();
        drain(
            &queue,
            "job",
            br#"<testsuite name="s" tests="2" failures="1">
                <testcase classname="c" name="a"/>
                <testcase classname="c" name="b"><failure message="nope"/></testcase>
            </testsuite>"#,
        )
        .await;

        let config = AggregatorConfig {
            output_format: OutputFormat::Junit,
            ..Default::default()
        };
        let report = Aggregator::new(queue, config).aggregate("job").await.unwrap();
        assert_eq!(report.total_items, 1);
        assert_eq!(report.failed_items, 1);
    }

    #[tokio::test]
    async fn test_job_result_summary() {
        let queue = Arc::new(MemoryQueue::new(3));
        queue.push("job", items(2)).await.unwrap();
        drain(&queue, "job", br#"{"status":"pass","metrics":{"tokens":7}}"#).await;

        let summary = aggregator(queue).job_result("job").await.unwrap();
        assert_eq!(summary.get("totalItems"), Some("2"));
        assert_eq!(summary.get("passRate"), Some("100.0"));
        assert_eq!(summary.get("totalTokens"), Some("14"));
        assert_eq!(summary.get("totalCost"), None);
    }

    #[tokio::test]
    async fn test_unknown_job_is_an_error() {
        let queue = Arc::new(MemoryQueue::new(3));
        let err = aggregator(queue).aggregate("missing").await.unwrap_err();
        assert!(matches!(
            err,
            AggregateError::QueueRead {
                source: QueueError::JobNotFound(_),
                ..
            }
        ));
    }

    /// Backend whose reads never return.
    struct StalledQueue;

    #[async_trait]
    impl WorkQueue for StalledQueue {
        async fn push(&self, _: &str, _: Vec<WorkItem>) -> Result<(), QueueError> {
            Ok(())
        }
        async fn pop(&self, _: &str) -> Result<Option<WorkItem>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &str, _: &str, _: Vec<u8>) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(&self, _: &str, _: &str, _: &str) -> Result<(), QueueError> {
            Ok(())
        }
        async fn get_completed_items(&self, _: &str) -> Result<Vec<WorkItem>, QueueError> {
            std::future::pending().await
        }
        async fn get_failed_items(&self, _: &str) -> Result<Vec<WorkItem>, QueueError> {
            Ok(Vec::new())
        }
        async fn progress(&self, _: &str) -> Result<JobProgress, QueueError> {
            Ok(JobProgress::default())
        }
        async fn requeue_stale(&self, _: &str, _: Duration) -> Result<usize, QueueError> {
            Ok(0)
        }
        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let config = AggregatorConfig {
            read_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let err = Aggregator::new(Arc::new(StalledQueue), config)
            .aggregate("job")
            .await
            .unwrap_err();

        match err {
            AggregateError::Timeout { what, after, .. } => {
                assert_eq!(what, "completed");
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
