//! JUnit XML worker payloads.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::ParseError;
use crate::types::{AssertionResult, ExecutionResult, ResultStatus};

#[derive(Debug, Default, Deserialize)]
struct TestSuitesDoc {
    #[serde(rename = "testsuite", default)]
    suites: Vec<TestSuite>,
}

#[derive(Debug, Default, Deserialize)]
struct TestSuite {
    #[serde(rename = "@tests", default)]
    tests: Option<u64>,

    #[serde(rename = "@failures", default)]
    failures: Option<u64>,

    #[serde(rename = "@errors", default)]
    errors: Option<u64>,

    #[serde(rename = "@skipped", default)]
    skipped: Option<u64>,

    #[serde(rename = "@time", default)]
    time: Option<String>,

    #[serde(rename = "testcase", default)]
    cases: Vec<TestCase>,
}

#[derive(Debug, Default, Deserialize)]
struct TestCase {
    #[serde(rename = "@name", default)]
    name: String,

    #[serde(rename = "@classname", default)]
    classname: String,

    #[serde(rename = "failure", default)]
    failures: Vec<Outcome>,

    #[serde(rename = "error", default)]
    errors: Vec<Outcome>,

    #[serde(rename = "skipped", default)]
    skipped: Vec<Outcome>,
}

/// Body of a `<failure>`, `<error>` or `<skipped>` element.
#[derive(Debug, Default, Deserialize)]
struct Outcome {
    #[serde(rename = "@message", default)]
    message: Option<String>,

    #[serde(rename = "$text", default)]
    text: Option<String>,
}

impl Outcome {
    fn describe(&self) -> String {
        self.message
            .as_deref()
            .filter(|m| !m.is_empty())
            .or(self.text.as_deref())
            .map(|m| m.trim().to_string())
            .unwrap_or_default()
    }
}

impl TestCase {
    fn to_assertion(&self) -> AssertionResult {
        let outcome = self.failures.first().or_else(|| self.errors.first());
        AssertionResult {
            name: format!("{}.{}", self.classname, self.name),
            passed: outcome.is_none(),
            message: outcome.map(Outcome::describe).unwrap_or_default(),
        }
    }
}

impl TestSuite {
    fn test_count(&self) -> u64 {
        self.tests.unwrap_or(self.cases.len() as u64)
    }

    fn seconds(&self) -> f64 {
        self.time
            .as_deref()
            .and_then(|t| t.trim().replace(',', "").parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(0.0)
    }

    fn count_cases(&self, pick: impl Fn(&TestCase) -> bool) -> u64 {
        self.cases.iter().filter(|c| pick(c)).count() as u64
    }
}

#[derive(Debug, Default)]
struct Totals {
    tests: u64,
    failures: u64,
    errors: u64,
    skipped: u64,
    seconds: f64,
    assertions: Vec<AssertionResult>,
}

impl Totals {
    fn add(&mut self, suite: &TestSuite) {
        self.tests = self.tests.saturating_add(suite.test_count());
        self.failures = self.failures.saturating_add(
            suite
                .failures
                .unwrap_or_else(|| suite.count_cases(|c| !c.failures.is_empty())),
        );
        self.errors = self.errors.saturating_add(
            suite
                .errors
                .unwrap_or_else(|| suite.count_cases(|c| !c.errors.is_empty())),
        );
        self.skipped = self.skipped.saturating_add(
            suite
                .skipped
                .unwrap_or_else(|| suite.count_cases(|c| !c.skipped.is_empty())),
        );
        self.seconds += suite.seconds();
        self.assertions
            .extend(suite.cases.iter().map(TestCase::to_assertion));
    }

    fn into_result(self) -> ExecutionResult {
        let status = if self.failures > 0 || self.errors > 0 {
            ResultStatus::Fail
        } else {
            ResultStatus::Pass
        };

        let metrics = BTreeMap::from([
            ("tests".to_string(), self.tests as f64),
            ("failures".to_string(), self.failures as f64),
            ("errors".to_string(), self.errors as f64),
            ("skipped".to_string(), self.skipped as f64),
        ]);

        ExecutionResult {
            status,
            duration: Duration::try_from_secs_f64(self.seconds).unwrap_or_default(),
            metrics: Some(metrics),
            assertions: (!self.assertions.is_empty()).then_some(self.assertions),
            ..Default::default()
        }
    }
}

/// Parse a JUnit XML report into an execution result.
///
/// Accepts either a `<testsuites>` document (totals are summed across all
/// suites) or a single `<testsuite>` document. Each test case becomes one
/// assertion named `classname.name`.
pub fn parse_junit_xml(data: &[u8]) -> Result<ExecutionResult, ParseError> {
    if data.is_empty() {
        return Err(ParseError::EmptyResult);
    }

    let text = std::str::from_utf8(data)
        .map_err(|e| ParseError::InvalidFormat(format!("not UTF-8: {}", e)))?;

    if let Ok(doc) = quick_xml::de::from_str::<TestSuitesDoc>(text) {
        if !doc.suites.is_empty() {
            let mut totals = Totals::default();
            for suite in &doc.suites {
                totals.add(suite);
            }
            return Ok(totals.into_result());
        }
    }

    match quick_xml::de::from_str::<TestSuite>(text) {
        Ok(suite) if suite.test_count() > 0 => {
            let mut totals = Totals::default();
            totals.add(&suite);
            Ok(totals.into_result())
        }
        Ok(_) => Err(ParseError::InvalidFormat(
            "no test suites or test cases found".to_string(),
        )),
        Err(e) => Err(ParseError::InvalidFormat(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINGLE_SUITE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuite name="arena" tests="3" failures="1" errors="0" skipped="0" time="1.5">
  <testcase classname="support" name="greeting" time="0.5"/>
  <testcase classname="support" name="refund_policy" time="0.5">
    <failure message="expected refund window of 30 days">assertion details</failure>
  </testcase>
  <testcase classname="support" name="escalation" time="0.5"/>
</testsuite>"#;

    const MULTI_SUITE: &str = r#"<testsuites>
  <testsuite name="a" tests="2" failures="0" errors="0" time="2">
    <testcase classname="a" name="one"/>
    <testcase classname="a" name="two"/>
  </testsuite>
  <testsuite name="b" tests="1" failures="0" errors="1" time="0.25">
    <testcase classname="b" name="three"><error>panicked at main.rs</error></testcase>
  </testsuite>
</testsuites>"#;

    #[test]
    fn test_single_suite_with_failure() {
        let result = parse_junit_xml(SINGLE_SUITE.as_bytes()).unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.duration, Duration::from_millis(1500));

        let assertions = result.assertions.unwrap();
        assert_eq!(assertions.len(), 3);
        assert_eq!(assertions[0].name, "support.greeting");
        assert!(assertions[0].passed);
        assert!(!assertions[1].passed);
        assert_eq!(assertions[1].message, "expected refund window of 30 days");
    }

    #[test]
    fn test_multi_suite_totals() {
        let result = parse_junit_xml(MULTI_SUITE.as_bytes()).unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.duration, Duration::from_millis(2250));
        assert_eq!(result.metric("tests"), Some(3.0));
        assert_eq!(result.metric("errors"), Some(1.0));

        let assertions = result.assertions.unwrap();
        assert_eq!(assertions.len(), 3);
        assert_eq!(assertions[2].name, "b.three");
        assert_eq!(assertions[2].message, "panicked at main.rs");
    }

    #[test]
    fn test_all_passing_suite() {
        let xml = r#"<testsuite tests="1"><testcase classname="c" name="ok"/></testsuite>"#;
        let result = parse_junit_xml(xml.as_bytes()).unwrap();
        assert_eq!(result.status, ResultStatus::Pass);
    }

    #[test]
    fn test_counts_derived_when_attributes_missing() {
        let xml = r#"<testsuite>
  <testcase classname="c" name="one"/>
  <testcase classname="c" name="two"><failure/></testcase>
</testsuite>"#;
        let result = parse_junit_xml(xml.as_bytes()).unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("tests"), Some(2.0));
        assert_eq!(result.metric("failures"), Some(1.0));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse_junit_xml(b""), Err(ParseError::EmptyResult));
    }

    #[test]
    fn test_unrecognized_documents() {
        assert!(matches!(
            parse_junit_xml(b"<report><line/></report>"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_junit_xml(b"<testsuites></testsuites>"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            parse_junit_xml(b"plain text"),
            Err(ParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_huge_counts_saturate() {
        let xml = r#"<testsuites>
  <testsuite name="a" tests="18446744073709551615" failures="18446744073709551615"/>
  <testsuite name="b" tests="4000000000" failures="1"/>
</testsuites>"#;
        let result = parse_junit_xml(xml.as_bytes()).unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("tests"), Some(u64::MAX as f64));
        assert_eq!(result.metric("failures"), Some(u64::MAX as f64));
    }

    #[test]
    fn test_output_between_test_cases() {
        let xml = r#"<testsuite name="s" tests="2" failures="1">
  <testcase classname="c" name="one"/>
  <system-out>model warmed up</system-out>
  <testcase classname="c" name="two"><failure message="wrong"/></testcase>
  <system-err/>
</testsuite>"#;
        let result = parse_junit_xml(xml.as_bytes()).unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        let assertions = result.assertions.unwrap();
        assert_eq!(assertions.len(), 2);
        assert_eq!(assertions[1].name, "c.two");
        assert!(!assertions[1].passed);
    }
}
