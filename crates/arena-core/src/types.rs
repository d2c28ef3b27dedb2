//! Work items and execution results.
//!
//! A `WorkItem` carries its own lifecycle: the transitions a queue backend
//! applies on `Pop`, `Ack` and `Nack` live here so they can be exercised
//! without any backend at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Lifecycle state of a work item inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting to be claimed
    #[default]
    Pending,

    /// Claimed by a worker
    InProgress,

    /// Acked with a result (terminal)
    Completed,

    /// Retries exhausted (terminal)
    Failed,
}

impl ItemStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::InProgress => write!(f, "in_progress"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An illegal state transition was requested.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} work item '{item_id}' in state {from}")]
pub struct TransitionError {
    pub item_id: String,
    pub from: ItemStatus,
    pub action: &'static str,
}

/// What a failed attempt did to the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Back to Pending for another attempt
    Requeued { attempts: u32 },

    /// Retries exhausted, item is now Failed
    Failed,
}

/// One scenario/provider execution unit tracked by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Unique within a job
    pub id: String,

    #[serde(default)]
    pub scenario_id: String,

    #[serde(default)]
    pub provider_id: String,

    #[serde(default)]
    pub status: ItemStatus,

    /// Raw worker payload, stored verbatim on Ack
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<u8>,

    /// Set only when the item is finalized as Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of times the item has been claimed
    #[serde(default)]
    pub attempts: u32,
}

impl WorkItem {
    /// Create a pending item.
    pub fn new(
        id: impl Into<String>,
        scenario_id: impl Into<String>,
        provider_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            scenario_id: scenario_id.into(),
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    /// Pending -> InProgress. Starts a new attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != ItemStatus::Pending {
            return Err(self.transition_error("claim"));
        }
        self.status = ItemStatus::InProgress;
        self.started_at = Some(now);
        self.attempts += 1;
        Ok(())
    }

    /// InProgress -> Completed.
    pub fn complete(&mut self, result: Vec<u8>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status != ItemStatus::InProgress {
            return Err(self.transition_error("ack"));
        }
        self.status = ItemStatus::Completed;
        self.result = result;
        self.completed_at = Some(now);
        Ok(())
    }

    /// InProgress -> Pending (retry) or Failed (retries exhausted).
    ///
    /// A `max_retries` of zero still allows the single attempt `claim`
    /// already consumed.
    pub fn fail_attempt(
        &mut self,
        message: impl Into<String>,
        max_retries: u32,
    ) -> Result<NackOutcome, TransitionError> {
        if self.status != ItemStatus::InProgress {
            return Err(self.transition_error("nack"));
        }

        if self.attempts < max_retries.max(1) {
            self.status = ItemStatus::Pending;
            return Ok(NackOutcome::Requeued {
                attempts: self.attempts,
            });
        }

        self.status = ItemStatus::Failed;
        self.error = Some(message.into());
        Ok(NackOutcome::Failed)
    }

    /// Wall-clock time of the last attempt, when both ends are known.
    pub fn elapsed(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).to_std().unwrap_or_default()),
            _ => None,
        }
    }

    fn transition_error(&self, action: &'static str) -> TransitionError {
        TransitionError {
            item_id: self.id.clone(),
            from: self.status,
            action,
        }
    }
}

/// Normalized verdict of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ResultStatus {
    Pass,
    Fail,
    #[default]
    Unknown,
    /// Any other worker-reported status, kept verbatim
    Other(String),
}

impl ResultStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ResultStatus::Pass => "pass",
            ResultStatus::Fail => "fail",
            ResultStatus::Unknown => "unknown",
            ResultStatus::Other(s) => s,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, ResultStatus::Pass)
    }
}

impl From<&str> for ResultStatus {
    fn from(s: &str) -> Self {
        match s {
            "pass" => ResultStatus::Pass,
            "fail" => ResultStatus::Fail,
            "unknown" => ResultStatus::Unknown,
            other => ResultStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResultStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResultStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ResultStatus::from(s.as_str()))
    }
}

/// A single pass/fail check within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Canonical form of one work item's outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub work_item_id: String,
    pub scenario_id: String,
    pub provider_id: String,
    pub status: ResultStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(rename = "durationMs", with = "crate::duration_ms")]
    pub duration: Duration,

    /// e.g. `tokens`, `cost`, `latency_ms`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, f64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertions: Option<Vec<AssertionResult>>,
}

impl ExecutionResult {
    /// Look up a metric by name.
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.as_ref().and_then(|m| m.get(name).copied())
    }
}
