//! Per-suite result aggregation.
//!
//! Workers push terminal [`CaseResult`]s into a [`ReportAggregator`] from
//! any thread and in any order. Each suite has its own lock, so an append
//! is one short critical section. A suite becomes reportable once every
//! method this shard assigned to it has a terminal result; its snapshot
//! is then sorted by declaration order, not arrival order.
//!
//! # Example
//!
//! ```
//! use shardline::catalog::{Catalog, Suite};
//! use shardline::report::ReportAggregator;
//! use shardline::runner::{CaseResult, TestOutcome};
//! use shardline::shard::{partition, ShardSpec};
//!
//! let catalog = Catalog::new(vec![Suite::new("A", ["m1", "m2"])]);
//! let assignment = partition(&catalog, ShardSpec::all());
//! let aggregator = ReportAggregator::new(&catalog, &assignment);
//!
//! aggregator.record(0, CaseResult::new(catalog.test_id(0, 1), 1, TestOutcome::Passed));
//! assert!(aggregator.snapshot(0).is_none());
//!
//! aggregator.record(0, CaseResult::new(catalog.test_id(0, 0), 0, TestOutcome::Passed));
//! let report = aggregator.snapshot(0).unwrap();
//! assert_eq!(report.cases[0].name, "m1");
//! assert_eq!(report.tests(), 2);
//! ```

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::capture::Captured;
use crate::catalog::Catalog;
use crate::runner::{CaseResult, Failure, TestOutcome};
use crate::shard::ShardAssignment;

/// The terminal result of one test case as it appears in a suite report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestCaseReport {
    pub classname: String,
    pub name: String,
    pub time: Duration,
    pub outcome: TestOutcome,
    pub failure: Option<Failure>,
    /// Attempts taken; bookkeeping only, never serialized to XML.
    pub attempts: usize,
    pub flaky: bool,
}

/// Immutable report for one suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Cases in declaration order.
    pub cases: Vec<TestCaseReport>,
    /// Captured stdout of suite setup, each case in order, and teardown.
    pub stdout: String,
    pub stderr: String,
    /// Time spent in suite setup and teardown.
    pub lifecycle_time: Duration,
}

impl SuiteReport {
    pub fn tests(&self) -> usize {
        self.cases.len()
    }

    pub fn failures(&self) -> usize {
        self.count(TestOutcome::Failed)
    }

    pub fn errors(&self) -> usize {
        self.count(TestOutcome::Error)
    }

    pub fn skipped(&self) -> usize {
        self.count(TestOutcome::Skipped)
    }

    pub fn passed(&self) -> usize {
        self.count(TestOutcome::Passed)
    }

    pub fn flaky(&self) -> usize {
        self.cases.iter().filter(|c| c.flaky).count()
    }

    /// Sum of the case times plus setup and teardown.
    pub fn time(&self) -> Duration {
        self.lifecycle_time + self.cases.iter().map(|c| c.time).sum::<Duration>()
    }

    /// Returns true if no case failed or errored.
    pub fn success(&self) -> bool {
        self.cases.iter().all(|c| c.outcome.is_success())
    }

    fn count(&self, outcome: TestOutcome) -> usize {
        self.cases.iter().filter(|c| c.outcome == outcome).count()
    }
}

struct SuiteAccumulator {
    name: String,
    expected: usize,
    preamble: Captured,
    trailer: Captured,
    lifecycle_time: Duration,
    cases: Vec<CaseResult>,
    faulted: bool,
}

impl SuiteAccumulator {
    fn is_complete(&self) -> bool {
        self.cases.len() >= self.expected
    }
}

/// Thread-safe accumulator of terminal results, keyed by suite position.
pub struct ReportAggregator {
    timestamp: DateTime<Utc>,
    slots: Vec<Option<Mutex<SuiteAccumulator>>>,
}

impl ReportAggregator {
    /// Registers every suite of the shard assignment with the number of
    /// terminal results it needs.
    ///
    /// An ignored suite with assigned methods expects one synthetic case.
    pub fn new(catalog: &Catalog, assignment: &ShardAssignment) -> Self {
        let mut slots: Vec<Option<Mutex<SuiteAccumulator>>> =
            (0..catalog.suites().len()).map(|_| None).collect();

        for assigned in assignment.suites() {
            let suite = &catalog.suites()[assigned.suite];
            let expected = if suite.ignored && !assigned.methods.is_empty() {
                1
            } else {
                assigned.methods.len()
            };
            slots[assigned.suite] = Some(Mutex::new(SuiteAccumulator {
                name: suite.name.clone(),
                expected,
                preamble: Captured::default(),
                trailer: Captured::default(),
                lifecycle_time: Duration::ZERO,
                cases: Vec::with_capacity(expected),
                faulted: false,
            }));
        }

        Self {
            timestamp: Utc::now(),
            slots,
        }
    }

    /// Overrides the timestamp stamped on snapshots.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Appends a terminal result.
    ///
    /// Returns false (and drops the result) if the suite is unknown, was
    /// faulted, is already complete, or already has a result at the same
    /// declaration position.
    pub fn record(&self, suite: usize, case: CaseResult) -> bool {
        let Some(mut acc) = self.lock(suite) else {
            warn!("Result for unregistered suite position {}", suite);
            return false;
        };

        if acc.faulted {
            return false;
        }
        if acc.is_complete() || acc.cases.iter().any(|c| c.order == case.order) {
            warn!("Dropping duplicate result for {}", case.id);
            return false;
        }

        acc.cases.push(case);
        true
    }

    /// Attaches output and time spent outside any method, e.g. during
    /// setup.
    pub fn record_suite_output(&self, suite: usize, output: Captured, elapsed: Duration) {
        if let Some(mut acc) = self.lock(suite) {
            acc.preamble.stdout.push_str(&output.stdout);
            acc.preamble.stderr.push_str(&output.stderr);
            acc.lifecycle_time += elapsed;
        }
    }

    /// Attaches output and time spent after the suite's last method, e.g.
    /// during teardown.
    pub fn record_trailing_output(&self, suite: usize, output: Captured, elapsed: Duration) {
        if let Some(mut acc) = self.lock(suite) {
            acc.trailer.stdout.push_str(&output.stdout);
            acc.trailer.stderr.push_str(&output.stderr);
            acc.lifecycle_time += elapsed;
        }
    }

    /// Replaces the suite's cases with a single suite-level case.
    ///
    /// Used when the suite could not be run at all. Only the first call
    /// per suite takes effect; returns whether this call did.
    pub fn fault_suite(&self, suite: usize, case: CaseResult) -> bool {
        let Some(mut acc) = self.lock(suite) else {
            return false;
        };
        if acc.faulted {
            return false;
        }
        acc.faulted = true;
        acc.expected = 1;
        acc.cases = vec![case];
        true
    }

    /// Returns true once every expected result for the suite is in.
    pub fn is_complete(&self, suite: usize) -> bool {
        self.lock(suite).is_some_and(|acc| acc.is_complete())
    }

    /// Number of expected results that have not arrived.
    pub fn pending(&self) -> usize {
        (0..self.slots.len())
            .filter_map(|i| self.lock(i))
            .map(|acc| acc.expected.saturating_sub(acc.cases.len()))
            .sum()
    }

    /// Snapshot of a complete suite; `None` while results are missing.
    pub fn snapshot(&self, suite: usize) -> Option<SuiteReport> {
        let acc = self.lock(suite)?;
        if !acc.is_complete() {
            return None;
        }

        let mut cases: Vec<&CaseResult> = acc.cases.iter().collect();
        cases.sort_by_key(|c| c.order);

        let mut stdout = acc.preamble.stdout.clone();
        let mut stderr = acc.preamble.stderr.clone();
        for case in &cases {
            stdout.push_str(&case.stdout);
            stderr.push_str(&case.stderr);
        }
        stdout.push_str(&acc.trailer.stdout);
        stderr.push_str(&acc.trailer.stderr);

        Some(SuiteReport {
            name: acc.name.clone(),
            timestamp: self.timestamp,
            cases: cases
                .into_iter()
                .map(|c| TestCaseReport {
                    classname: c.id.suite.clone(),
                    name: c.id.name.clone(),
                    time: c.duration,
                    outcome: c.outcome,
                    failure: c.failure.clone(),
                    attempts: c.attempts,
                    flaky: c.flaky,
                })
                .collect(),
            stdout,
            stderr,
            lifecycle_time: acc.lifecycle_time,
        })
    }

    /// Snapshots of every complete suite with at least one case, in
    /// catalog order.
    pub fn snapshots(&self) -> Vec<SuiteReport> {
        (0..self.slots.len())
            .filter_map(|i| self.snapshot(i))
            .filter(|r| !r.cases.is_empty())
            .collect()
    }

    /// Names of suites still waiting for results.
    pub fn incomplete_suites(&self) -> Vec<String> {
        (0..self.slots.len())
            .filter_map(|i| self.lock(i))
            .filter(|acc| !acc.is_complete())
            .map(|acc| acc.name.clone())
            .collect()
    }

    fn lock(&self, suite: usize) -> Option<MutexGuard<'_, SuiteAccumulator>> {
        self.slots
            .get(suite)?
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::catalog::{Suite, TestId};
    use crate::shard::{ShardSpec, partition};

    fn catalog() -> Catalog {
        Catalog::new(vec![
            Suite::new("XmlReportTest", ["testXmlErrors", "testXmlFails", "testXmlPasses", "testXmlSkipped"]),
            Suite::new("Empty", ["only"]),
            Suite::new("Ignored", ["a", "b"]).set_ignored(),
        ])
    }

    fn case(catalog: &Catalog, suite: usize, method: usize, outcome: TestOutcome) -> CaseResult {
        CaseResult::new(catalog.test_id(suite, method), method, outcome)
    }

    #[test]
    fn test_mixed_outcomes_counts_and_output() {
        let catalog = catalog();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()));

        aggregator.record(
            0,
            case(&catalog, 0, 3, TestOutcome::Skipped).normalized(),
        );
        aggregator.record(
            0,
            case(&catalog, 0, 2, TestOutcome::Passed)
                .with_output("Test output\n", "")
                .with_duration(Duration::from_millis(3)),
        );
        aggregator.record(
            0,
            case(&catalog, 0, 0, TestOutcome::Error)
                .with_failure(Failure::new("java.lang.Exception").with_message("testXmlErrors exception")),
        );
        assert!(!aggregator.is_complete(0));
        aggregator.record(
            0,
            case(&catalog, 0, 1, TestOutcome::Failed).with_failure(Failure::new("AssertionError")),
        );

        let report = aggregator.snapshot(0).unwrap();
        assert_eq!(report.tests(), 4);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.errors(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.passed(), 1);
        assert_eq!(
            report.tests(),
            report.failures() + report.errors() + report.skipped() + report.passed()
        );
        assert_eq!(report.stdout, "Test output\n");
        let names: Vec<_> = report.cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["testXmlErrors", "testXmlFails", "testXmlPasses", "testXmlSkipped"]
        );
    }

    #[test]
    fn test_duplicate_result_rejected() {
        let catalog = catalog();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()));
        assert!(aggregator.record(1, case(&catalog, 1, 0, TestOutcome::Failed)));
        assert!(!aggregator.record(1, case(&catalog, 1, 0, TestOutcome::Passed)));
        assert_eq!(aggregator.snapshot(1).unwrap().cases[0].outcome, TestOutcome::Failed);
    }

    #[test]
    fn test_ignored_suite_expects_single_case() {
        let catalog = catalog();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()));
        assert!(!aggregator.is_complete(2));
        aggregator.record(
            2,
            CaseResult::new(TestId::new("Ignored", "Ignored"), 0, TestOutcome::Skipped),
        );
        let report = aggregator.snapshot(2).unwrap();
        assert_eq!(report.tests(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.time(), Duration::ZERO);
    }

    #[test]
    fn test_fault_replaces_cases_once() {
        let catalog = catalog();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()));
        aggregator.record(0, case(&catalog, 0, 0, TestOutcome::Passed));

        let synthetic = CaseResult::new(
            TestId::new("XmlReportTest", "XmlReportTest"),
            0,
            TestOutcome::Error,
        );
        assert!(aggregator.fault_suite(0, synthetic.clone()));
        assert!(!aggregator.fault_suite(0, synthetic));
        assert!(!aggregator.record(0, case(&catalog, 0, 1, TestOutcome::Passed)));

        let report = aggregator.snapshot(0).unwrap();
        assert_eq!(report.tests(), 1);
        assert_eq!(report.errors(), 1);
    }

    #[test]
    fn test_shard_with_empty_suite() {
        let catalog = Catalog::new(vec![
            Suite::new("A", ["m1", "m2"]),
            Suite::new("B", ["m3"]),
        ]);
        let assignment = partition(&catalog, "1/2".parse().unwrap());
        let aggregator = ReportAggregator::new(&catalog, &assignment);

        // B has nothing in shard 1: complete, but not worth a report.
        assert!(aggregator.is_complete(1));
        assert_eq!(aggregator.pending(), 1);
        aggregator.record(0, case(&catalog, 0, 1, TestOutcome::Passed));
        assert_eq!(aggregator.pending(), 0);
        let names: Vec<_> = aggregator.snapshots().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["A"]);
    }

    #[test]
    fn test_concurrent_appends_sorted_by_declaration() {
        let methods: Vec<String> = (0..64).map(|i| format!("m{:02}", i)).collect();
        let catalog = Arc::new(Catalog::new(vec![Suite::new("Big", methods)]));
        let assignment = partition(&catalog, ShardSpec::all());
        let aggregator = Arc::new(ReportAggregator::new(&catalog, &assignment));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let catalog = catalog.clone();
                let aggregator = aggregator.clone();
                std::thread::spawn(move || {
                    for m in (worker..64).step_by(4).rev() {
                        let case = CaseResult::new(catalog.test_id(0, m), m, TestOutcome::Passed)
                            .with_output(format!("{}\n", m), "");
                        aggregator.record(0, case);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let report = aggregator.snapshot(0).unwrap();
        assert_eq!(report.tests(), 64);
        let expected: String = (0..64).map(|m| format!("{}\n", m)).collect();
        assert_eq!(report.stdout, expected);
        assert!(report.cases.windows(2).all(|w| w[0].name < w[1].name));
    }

    #[test]
    fn test_setup_output_precedes_cases() {
        let catalog = catalog();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()));
        aggregator.record_suite_output(
            1,
            Captured {
                stdout: "setup\n".into(),
                stderr: String::new(),
            },
            Duration::ZERO,
        );
        aggregator.record(1, case(&catalog, 1, 0, TestOutcome::Passed).with_output("body\n", ""));
        assert_eq!(aggregator.snapshot(1).unwrap().stdout, "setup\nbody\n");
    }

    #[test]
    fn test_lifecycle_time_counts_toward_suite_time() {
        let catalog = catalog();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()));
        aggregator.record_suite_output(1, Captured::default(), Duration::from_millis(30));
        aggregator.fault_suite(
            1,
            CaseResult::new(TestId::new("Empty", "Empty"), 0, TestOutcome::Error)
                .with_failure(Failure::new("SetupError")),
        );
        aggregator.record_trailing_output(1, Captured::default(), Duration::from_millis(20));

        let report = aggregator.snapshot(1).unwrap();
        assert_eq!(report.lifecycle_time, Duration::from_millis(50));
        assert_eq!(report.time(), Duration::from_millis(50));
    }

    #[test]
    fn test_fixed_timestamp_snapshots_are_identical() {
        use chrono::TimeZone;

        let catalog = catalog();
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let aggregator = ReportAggregator::new(&catalog, &partition(&catalog, ShardSpec::all()))
            .with_timestamp(timestamp);
        aggregator.record(1, case(&catalog, 1, 0, TestOutcome::Passed).with_output("once\n", ""));

        let first = aggregator.snapshot(1).unwrap();
        let second = aggregator.snapshot(1).unwrap();
        assert_eq!(first.timestamp, timestamp);
        assert_eq!(first, second);

        let xml = crate::report::to_xml(&first).unwrap();
        assert_eq!(xml, crate::report::to_xml(&second).unwrap());
        assert!(xml.contains(r#"timestamp="2024-05-01T12:00:00""#));
    }
}
