//! Flat summary persisted onto an ArenaJob's status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::aggregate::AggregatedResult;

/// Summary written to `status.result.summary`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobResult {
    pub summary: BTreeMap<String, String>,
}

impl JobResult {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.summary.get(key).map(String::as_str)
    }
}

impl From<&AggregatedResult> for JobResult {
    fn from(result: &AggregatedResult) -> Self {
        let mut summary = BTreeMap::new();
        summary.insert("passRate".to_string(), format!("{:.1}", result.pass_rate));
        summary.insert("totalItems".to_string(), result.total_items.to_string());
        summary.insert("passedItems".to_string(), result.passed_items.to_string());
        summary.insert("failedItems".to_string(), result.failed_items.to_string());
        summary.insert(
            "avgDurationMs".to_string(),
            result.avg_duration.as_millis().to_string(),
        );

        if result.total_tokens > 0 {
            summary.insert("totalTokens".to_string(), result.total_tokens.to_string());
        }
        if result.total_cost > 0.0 {
            summary.insert("totalCost".to_string(), format!("{:.4}", result.total_cost));
        }

        Self { summary }
    }
}

/// Adapt an aggregated report for status persistence; `None` stays `None`.
pub fn to_job_result(result: Option<&AggregatedResult>) -> Option<JobResult> {
    result.map(JobResult::from)
}
