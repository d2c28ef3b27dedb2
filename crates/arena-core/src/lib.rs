//! # arena-core
//!
//! Deterministic building blocks for Arena Fleet evaluation jobs.
//!
//! An evaluation job fans a scenario suite out across many providers as
//! independent work items. This crate owns everything about those items
//! that does not need I/O:
//!
//! - the work item lifecycle (`Pending -> InProgress -> Completed | Failed`,
//!   with bounded retries)
//! - parsing worker payloads (JSON or JUnit XML) into an [`ExecutionResult`]
//! - folding results into an [`AggregatedResult`] with per-scenario,
//!   per-provider and per-error statistics
//! - flattening that report into the [`JobResult`] summary map
//!
//! Queue backends and the async aggregator live in `arena-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use arena_core::{parse_execution_result, to_job_result, Aggregation};
//!
//! let mut aggregation = Aggregation::new();
//! for item in &completed_items {
//!     aggregation.add_result(&parse_execution_result(item)?);
//! }
//! let report = aggregation.finish();
//! let summary = to_job_result(Some(&report));
//! ```

pub mod aggregate;
pub mod job_result;
pub mod parser;
pub mod types;

// Re-export main types at crate root
pub use aggregate::{
    AggregatedResult, Aggregation, ErrorSummary, ProviderStats, ScenarioStats, UNKNOWN_ERROR,
};
pub use job_result::{to_job_result, JobResult};
pub use parser::{
    parse_execution_result, parse_junit_xml, parse_with_format, OutputFormat, ParseError,
    ResultPayload, RESULT_SCHEMA_VERSION,
};
pub use types::{
    AssertionResult, ExecutionResult, ItemStatus, NackOutcome, ResultStatus, TransitionError,
    WorkItem,
};

/// Serde helper: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
