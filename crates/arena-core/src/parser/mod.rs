//! Result parsing.
//!
//! Workers write either a JSON object or a JUnit XML document into a work
//! item's result bytes. This module turns those bytes, together with the
//! item's queue-level state, into a canonical [`ExecutionResult`].
//!
//! Malformed payloads are never fatal: the parser falls back to inferring
//! the verdict from the item's queue status so one bad worker output cannot
//! abort an aggregation run.

mod json;
mod junit;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::types::{ExecutionResult, ItemStatus, ResultStatus, WorkItem};

pub use json::{parse_execution_result, ResultPayload, RESULT_SCHEMA_VERSION};
pub use junit::parse_junit_xml;

/// Errors returned by the parsers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The item carries no identity (a zero-valued record).
    #[error("work item is nil")]
    NilWorkItem,

    #[error("result is empty")]
    EmptyResult,

    #[error("invalid result format: {0}")]
    InvalidFormat(String),
}

/// Payload format a job's workers write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Junit,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Junit => write!(f, "junit"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "junit" | "xml" => Ok(OutputFormat::Junit),
            other => Err(ParseError::InvalidFormat(format!(
                "unknown output format '{}'",
                other
            ))),
        }
    }
}

/// Parse a work item whose payload is known to be in `format`.
///
/// JUnit payloads get the item's identity and timestamp-derived duration
/// applied on top of the suite totals. If the JUnit document cannot be
/// parsed, the verdict is inferred from the item's queue status instead.
pub fn parse_with_format(
    item: &WorkItem,
    format: OutputFormat,
) -> Result<ExecutionResult, ParseError> {
    match format {
        OutputFormat::Json => parse_execution_result(item),
        OutputFormat::Junit => {
            let mut base = base_result(item)?;
            match parse_junit_xml(&item.result) {
                Ok(suite) => {
                    base.status = suite.status;
                    base.metrics = suite.metrics;
                    base.assertions = suite.assertions;
                    if item.elapsed().is_none() {
                        base.duration = suite.duration;
                    }
                    if let Some(error) = item.error.as_deref() {
                        base.error = error.to_string();
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        work_item = %item.id,
                        error = %e,
                        "JUnit payload unusable, inferring status"
                    );
                    infer_from_item(&mut base, item);
                }
            }
            Ok(base)
        }
    }
}

/// Identity and timestamp-derived duration shared by every parse path.
pub(crate) fn base_result(item: &WorkItem) -> Result<ExecutionResult, ParseError> {
    if item.id.is_empty() {
        return Err(ParseError::NilWorkItem);
    }

    Ok(ExecutionResult {
        work_item_id: item.id.clone(),
        scenario_id: item.scenario_id.clone(),
        provider_id: item.provider_id.clone(),
        duration: item.elapsed().unwrap_or_default(),
        ..Default::default()
    })
}

/// Status purely from the queue-level state.
pub(crate) fn infer_from_item(result: &mut ExecutionResult, item: &WorkItem) {
    match item.status {
        ItemStatus::Completed => result.status = ResultStatus::Pass,
        ItemStatus::Failed => {
            result.status = ResultStatus::Fail;
            result.error = item.error.clone().unwrap_or_default();
        }
        ItemStatus::Pending | ItemStatus::InProgress => result.status = ResultStatus::Unknown,
    }
}
