//! Aggregation of execution results into a job report.
//!
//! The fold is deterministic: dimension maps are `BTreeMap`s and error
//! summaries keep first-seen order, so folding the same items in the same
//! order always yields an identical report.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::types::{ExecutionResult, WorkItem};

/// Message used for failures that carry no error text.
pub const UNKNOWN_ERROR: &str = "unknown error";

/// Counters for one scenario.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioStats {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    /// Percentage in `[0, 100]`
    pub pass_rate: f64,
    #[serde(rename = "totalDurationMs", with = "crate::duration_ms")]
    pub total_duration: Duration,
    #[serde(rename = "avgDurationMs", with = "crate::duration_ms")]
    pub avg_duration: Duration,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Provider counters share the scenario shape.
pub type ProviderStats = ScenarioStats;

impl ScenarioStats {
    fn record(&mut self, result: &ExecutionResult) {
        self.total += 1;
        self.total_duration = self.total_duration.saturating_add(result.duration);
        if result.status.is_pass() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        if let Some(tokens) = result.metric("tokens") {
            // `as` clamps negatives and NaN to 0 and huge values to u64::MAX
            self.total_tokens = self.total_tokens.saturating_add(tokens as u64);
        }
        if let Some(cost) = result.metric("cost") {
            self.total_cost += cost;
        }
    }

    fn finalize(&mut self) {
        (self.pass_rate, self.avg_duration) =
            rate_and_average(self.passed, self.total, self.total_duration);
    }
}

/// One distinct error message and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub message: String,
    pub count: u64,
    pub work_item_ids: Vec<String>,
}

/// Full report for one job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    pub total_items: u64,
    pub passed_items: u64,
    pub failed_items: u64,
    pub pass_rate: f64,
    #[serde(rename = "totalDurationMs", with = "crate::duration_ms")]
    pub total_duration: Duration,
    #[serde(rename = "avgDurationMs", with = "crate::duration_ms")]
    pub avg_duration: Duration,
    pub total_tokens: u64,
    pub total_cost: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_scenario: Option<BTreeMap<String, ScenarioStats>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_provider: Option<BTreeMap<String, ProviderStats>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ErrorSummary>>,
}

/// Running fold over a job's terminal items.
#[derive(Debug, Default)]
pub struct Aggregation {
    totals: ScenarioStats,
    by_scenario: BTreeMap<String, ScenarioStats>,
    by_provider: BTreeMap<String, ProviderStats>,
    errors: Vec<ErrorSummary>,
    error_index: HashMap<String, usize>,
}

impl Aggregation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one parsed result.
    pub fn add_result(&mut self, result: &ExecutionResult) {
        self.totals.record(result);

        if !result.status.is_pass() && !result.error.is_empty() {
            self.record_error(&result.error, &result.work_item_id);
        }

        if !result.scenario_id.is_empty() {
            self.by_scenario
                .entry(result.scenario_id.clone())
                .or_default()
                .record(result);
        }
        if !result.provider_id.is_empty() {
            self.by_provider
                .entry(result.provider_id.clone())
                .or_default()
                .record(result);
        }
    }

    /// Count an item that could not be parsed as one failure.
    pub fn add_unparsed(&mut self, item: &WorkItem) {
        self.totals.total += 1;
        self.totals.failed += 1;
        self.record_error(item.error.as_deref().unwrap_or_default(), &item.id);
    }

    fn record_error(&mut self, message: &str, work_item_id: &str) {
        let message = if message.is_empty() { UNKNOWN_ERROR } else { message };

        match self.error_index.get(message) {
            Some(&idx) => {
                let summary = &mut self.errors[idx];
                summary.count += 1;
                summary.work_item_ids.push(work_item_id.to_string());
            }
            None => {
                self.error_index
                    .insert(message.to_string(), self.errors.len());
                self.errors.push(ErrorSummary {
                    message: message.to_string(),
                    count: 1,
                    work_item_ids: vec![work_item_id.to_string()],
                });
            }
        }
    }

    /// Compute rates and averages and normalize empty collections away.
    pub fn finish(self) -> AggregatedResult {
        let Aggregation {
            mut totals,
            mut by_scenario,
            mut by_provider,
            errors,
            ..
        } = self;

        totals.finalize();
        by_scenario.values_mut().for_each(ScenarioStats::finalize);
        by_provider.values_mut().for_each(ScenarioStats::finalize);

        AggregatedResult {
            total_items: totals.total,
            passed_items: totals.passed,
            failed_items: totals.failed,
            pass_rate: totals.pass_rate,
            total_duration: totals.total_duration,
            avg_duration: totals.avg_duration,
            total_tokens: totals.total_tokens,
            total_cost: totals.total_cost,
            by_scenario: (!by_scenario.is_empty()).then_some(by_scenario),
            by_provider: (!by_provider.is_empty()).then_some(by_provider),
            errors: (!errors.is_empty()).then_some(errors),
        }
    }
}

fn rate_and_average(passed: u64, total: u64, total_duration: Duration) -> (f64, Duration) {
    if total == 0 {
        return (0.0, Duration::ZERO);
    }
    let rate = passed as f64 / total as f64 * 100.0;
    let avg_nanos = total_duration.as_nanos() / u128::from(total);
    let avg = Duration::from_nanos(u64::try_from(avg_nanos).unwrap_or(u64::MAX));
    (rate, avg)
}
