//! JSON worker payloads.

use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{base_result, infer_from_item, ParseError};
use crate::types::{AssertionResult, ExecutionResult, ResultStatus, WorkItem};

/// Newest payload schema this parser understands.
pub const RESULT_SCHEMA_VERSION: u32 = 1;

/// Schema of the JSON object a worker writes on Ack.
///
/// Coercion rules:
/// - `durationMs` accepts a number or a numeric string
/// - metric values accept numbers or numeric strings; anything else is dropped
/// - `duration` uses the humantime grammar (`1m 30s`, `250ms`) plus single-unit
///   fractional forms such as `1.5s`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default, deserialize_with = "lenient_f64")]
    pub duration_ms: Option<f64>,

    #[serde(default)]
    pub duration: Option<String>,

    #[serde(default, deserialize_with = "lenient_metrics")]
    pub metrics: Option<BTreeMap<String, f64>>,

    #[serde(default)]
    pub assertions: Option<Vec<PayloadAssertion>>,
}

/// One assertion as written by a worker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadAssertion {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub passed: bool,

    #[serde(default)]
    pub message: Option<String>,
}

impl ResultPayload {
    /// Duration reported by the worker itself; milliseconds win over the
    /// string form.
    pub fn reported_duration(&self) -> Option<Duration> {
        if let Some(ms) = self.duration_ms.filter(|ms| *ms > 0.0) {
            if let Ok(d) = Duration::try_from_secs_f64(ms / 1000.0) {
                return Some(d);
            }
        }
        self.duration.as_deref().and_then(parse_duration)
    }
}

/// Convert a work item into a canonical result.
///
/// Fails only for a nil (identity-less) item. An empty or undecodable
/// payload yields a result whose status is inferred from the item's queue
/// status.
pub fn parse_execution_result(item: &WorkItem) -> Result<ExecutionResult, ParseError> {
    let mut result = base_result(item)?;

    if item.result.is_empty() {
        infer_from_item(&mut result, item);
        return Ok(result);
    }

    let payload: ResultPayload = match serde_json::from_slice(&item.result) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(
                work_item = %item.id,
                error = %e,
                "Result payload is not valid JSON, inferring status"
            );
            infer_from_item(&mut result, item);
            return Ok(result);
        }
    };

    if let Some(version) = payload.version.filter(|v| *v > RESULT_SCHEMA_VERSION) {
        tracing::warn!(
            work_item = %item.id,
            version,
            supported = RESULT_SCHEMA_VERSION,
            "Result payload uses a newer schema, decoding known fields only"
        );
    }

    match payload.status.as_deref().filter(|s| !s.is_empty()) {
        Some(status) => result.status = ResultStatus::from(status),
        None => infer_from_item(&mut result, item),
    }

    match payload.error.as_deref().filter(|e| !e.is_empty()) {
        Some(error) => result.error = error.to_string(),
        None => result.error = item.error.clone().unwrap_or_default(),
    }

    // Queue timestamps win over the worker's own measurement.
    if item.elapsed().is_none() {
        if let Some(d) = payload.reported_duration() {
            result.duration = d;
        }
    }

    result.metrics = payload.metrics.filter(|m| !m.is_empty());
    result.assertions = payload
        .assertions
        .filter(|a| !a.is_empty())
        .map(|assertions| {
            assertions
                .into_iter()
                .map(|a| AssertionResult {
                    name: a.name,
                    passed: a.passed,
                    message: a.message.unwrap_or_default(),
                })
                .collect()
        });

    Ok(result)
}

/// Parse a duration string such as `1m 30s`, `250ms` or `1.5s`.
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(d) = humantime::parse_duration(s) {
        return Some(d);
    }

    let split = s.find(|c: char| c.is_alphabetic())?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number.trim().parse().ok()?;
    let scale = match unit {
        "ns" => 1e-9,
        "us" | "µs" => 1e-6,
        "ms" => 1e-3,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(value * scale).ok()
}

fn coerce_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(coerce_f64(&value))
}

fn lenient_metrics<'de, D>(deserializer: D) -> Result<Option<BTreeMap<String, f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    let JsonValue::Object(map) = value else {
        return Ok(None);
    };

    let metrics = map
        .iter()
        .filter_map(|(name, v)| coerce_f64(v).map(|f| (name.clone(), f)))
        .collect();
    Ok(Some(metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemStatus;
    use chrono::{Duration as ChronoDuration, Utc};

    fn item_with(status: ItemStatus, payload: &str) -> WorkItem {
        let mut item = WorkItem::new("w1", "scenario-a", "anthropic");
        item.status = status;
        item.result = payload.as_bytes().to_vec();
        item
    }

    #[test]
    fn test_empty_payload_infers_from_status() {
        let completed = item_with(ItemStatus::Completed, "");
        assert_eq!(
            parse_execution_result(&completed).unwrap().status,
            ResultStatus::Pass
        );

        let mut failed = item_with(ItemStatus::Failed, "");
        failed.error = Some("connection timeout".to_string());
        let result = parse_execution_result(&failed).unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.error, "connection timeout");

        let pending = item_with(ItemStatus::Pending, "");
        assert_eq!(
            parse_execution_result(&pending).unwrap().status,
            ResultStatus::Unknown
        );
    }

    #[test]
    fn test_garbage_payload_falls_back() {
        let item = item_with(ItemStatus::Completed, "{not json");
        let result = parse_execution_result(&item).unwrap();
        assert_eq!(result.status, ResultStatus::Pass);
        assert!(result.metrics.is_none());
    }

    #[test]
    fn test_non_object_payload_falls_back() {
        let item = item_with(ItemStatus::Failed, r#""just a string""#);
        assert_eq!(
            parse_execution_result(&item).unwrap().status,
            ResultStatus::Fail
        );
    }

    #[test]
    fn test_full_payload() {
        let item = item_with(
            ItemStatus::Completed,
            r#"{
                "status": "fail",
                "error": "assertion failed",
                "durationMs": 250,
                "metrics": {"tokens": 120, "cost": "0.002", "model": "gpt-4o"},
                "assertions": [
                    {"name": "no_pii", "passed": true},
                    {"name": "tone", "passed": false, "message": "too curt"}
                ]
            }"#,
        );

        let result = parse_execution_result(&item).unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.error, "assertion failed");
        assert_eq!(result.duration, Duration::from_millis(250));
        assert_eq!(result.metric("tokens"), Some(120.0));
        assert_eq!(result.metric("cost"), Some(0.002));
        assert_eq!(result.metric("model"), None);

        let assertions = result.assertions.unwrap();
        assert_eq!(assertions.len(), 2);
        assert!(!assertions[1].passed);
        assert_eq!(assertions[1].message, "too curt");
    }

    #[test]
    fn test_missing_status_is_inferred() {
        let item = item_with(ItemStatus::Completed, r#"{"durationMs": 10}"#);
        assert_eq!(
            parse_execution_result(&item).unwrap().status,
            ResultStatus::Pass
        );
    }

    #[test]
    fn test_item_error_used_when_payload_has_none() {
        let mut item = item_with(ItemStatus::Failed, r#"{"status": "fail"}"#);
        item.error = Some("worker crashed".to_string());
        assert_eq!(parse_execution_result(&item).unwrap().error, "worker crashed");
    }

    #[test]
    fn test_timestamps_override_reported_duration() {
        let mut item = item_with(ItemStatus::Completed, r#"{"status": "pass", "durationMs": 100}"#);
        let start = Utc::now();
        item.started_at = Some(start);
        item.completed_at = Some(start + ChronoDuration::seconds(2));

        let result = parse_execution_result(&item).unwrap();
        assert_eq!(result.duration, Duration::from_secs(2));
    }

    #[test]
    fn test_duration_string_forms() {
        let item = item_with(ItemStatus::Completed, r#"{"duration": "1.5s"}"#);
        assert_eq!(
            parse_execution_result(&item).unwrap().duration,
            Duration::from_millis(1500)
        );

        let item = item_with(ItemStatus::Completed, r#"{"durationMs": "75", "duration": "9s"}"#);
        assert_eq!(
            parse_execution_result(&item).unwrap().duration,
            Duration::from_millis(75)
        );

        assert_eq!(parse_duration("1m 30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("-2s"), None);
    }

    #[test]
    fn test_empty_metrics_and_assertions_are_omitted() {
        let item = item_with(ItemStatus::Completed, r#"{"metrics": {}, "assertions": []}"#);
        let result = parse_execution_result(&item).unwrap();
        assert!(result.metrics.is_none());
        assert!(result.assertions.is_none());
    }

    #[test]
    fn test_nil_item() {
        let item = WorkItem::default();
        assert_eq!(parse_execution_result(&item), Err(ParseError::NilWorkItem));
    }
}
