//! Retry and flakiness detection logic.
//!
//! [`RetryController`] runs one method to its terminal outcome: it builds a
//! fresh fixture for every attempt, captures that attempt's output, and
//! re-runs unexpected failures up to the configured bound. Only the
//! terminal attempt is turned into a [`CaseResult`]; output of superseded
//! attempts is dropped.
//!
//! | Attempt outcome | Action |
//! |-----------------|--------|
//! | Passed / Skipped | Terminal |
//! | Expected failure | Terminal, reported as passed, never retried |
//! | Failed / Error, budget left | Retry with a new fixture |
//! | Failed / Error, budget spent | Terminal failure |
//!
//! [`RetryLedger`] keeps per-test attempt counts across a run for
//! flakiness statistics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::capture::{CaptureScope, Captured};
use crate::catalog::{Method, Suite, TestId};
use crate::recorder::{InvocationEvent, NullRecorder, Recorder};
use crate::runner::{CaseResult, Failure, Fixture, Outcome, TestOutcome, UnitRunner, catch_panic};

/// One concrete execution of a method.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// 0-based attempt number.
    pub index: usize,
    pub outcome: Outcome,
    pub elapsed: Duration,
    pub output: Captured,
}

/// Drives the attempts of a single method.
pub struct RetryController<'a, R> {
    runner: &'a R,
    max_retries: usize,
    recorder: &'a dyn Recorder,
    ledger: Option<&'a RetryLedger>,
    echo: bool,
}

impl<'a, R: UnitRunner> RetryController<'a, R> {
    /// Creates a controller allowing up to `max_retries` re-runs.
    pub fn new(runner: &'a R, max_retries: usize) -> Self {
        Self {
            runner,
            max_retries,
            recorder: &NullRecorder,
            ledger: None,
            echo: false,
        }
    }

    /// Reports instantiations and invocations to `recorder`.
    pub fn with_recorder(mut self, recorder: &'a dyn Recorder) -> Self {
        self.recorder = recorder;
        self
    }

    /// Tracks attempts in `ledger`.
    pub fn with_ledger(mut self, ledger: &'a RetryLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Echoes captured output to the console while capturing.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Runs the method at `order` in `suite` until it reaches a terminal
    /// outcome.
    ///
    /// At most `max_retries + 1` attempts are made. The returned result
    /// reflects the terminal attempt only. An `order` past the end of the
    /// suite yields an errored result without any attempt.
    pub fn invoke_with_retry(&self, suite: &Suite, order: usize) -> CaseResult {
        let Some(method) = suite.methods.get(order) else {
            warn!("{} has no method at position {}", suite.name, order);
            return CaseResult::new(TestId::new(&suite.name, format!("#{}", order)), order, TestOutcome::Error)
                .with_failure(Failure::new("UnknownMethod").with_message(format!(
                    "{} declares {} methods, position {} requested",
                    suite.name,
                    suite.methods.len(),
                    order
                )));
        };
        let id = TestId::new(&suite.name, &method.name);
        let mut index = 0;

        loop {
            let attempt = self.attempt(suite, method, &id, index);
            let succeeded =
                attempt.outcome.status == TestOutcome::Passed || attempt.outcome.expected_failure;
            if let Some(ledger) = self.ledger {
                ledger.record_attempt(&id, succeeded);
            }

            if attempt.outcome.is_terminal() || index >= self.max_retries {
                return self.terminal(id, order, attempt);
            }

            debug!(
                "Retrying {} after {:?} (attempt {} of {})",
                id,
                attempt.outcome.status,
                index + 2,
                self.max_retries + 1
            );
            index += 1;
        }
    }

    /// Runs a single attempt with a fresh fixture.
    pub fn attempt(&self, suite: &Suite, method: &Method, id: &TestId, index: usize) -> Attempt {
        self.recorder.record(InvocationEvent::Instantiated {
            id: id.clone(),
            attempt: index,
        });

        let scope = CaptureScope::begin(self.echo);
        let start = Instant::now();

        let result = catch_panic(|| -> Result<Outcome, Failure> {
            let mut fixture = self.runner.instantiate(suite)?;
            self.recorder.record(InvocationEvent::Invoked {
                id: id.clone(),
                attempt: index,
            });
            Ok(fixture.invoke(method))
        });

        let elapsed = start.elapsed();
        let output = scope.finish();

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(failure)) => Outcome::error(failure),
            Err(failure) => Outcome::error(failure),
        };

        Attempt {
            index,
            outcome,
            elapsed,
            output,
        }
    }

    fn terminal(&self, id: TestId, order: usize, attempt: Attempt) -> CaseResult {
        let attempts = attempt.index + 1;
        let Attempt {
            outcome, output, elapsed, ..
        } = attempt;

        let status = if outcome.expected_failure {
            TestOutcome::Passed
        } else {
            outcome.status
        };

        if !status.is_success() && attempts > 1 {
            warn!("{} still {:?} after {} attempts", id, status, attempts);
        }

        let mut result = CaseResult::new(id, order, status)
            .with_duration(elapsed)
            .with_output(output.stdout, output.stderr)
            .with_attempts(attempts);
        result.failure = outcome.failure;
        result.flaky = status == TestOutcome::Passed && attempts > 1;
        result.normalized()
    }
}

/// Per-test attempt and success counts for a run.
#[derive(Clone, Default)]
pub struct RetryLedger {
    /// Tracks attempts per test: (attempts, successes)
    attempts: Arc<Mutex<HashMap<TestId, (usize, usize)>>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt.
    pub fn record_attempt(&self, id: &TestId, success: bool) {
        let mut attempts = self.lock();
        let entry = attempts.entry(id.clone()).or_insert((0, 0));
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
    }

    /// Get the number of attempts for a test.
    pub fn attempts(&self, id: &TestId) -> usize {
        self.lock().get(id).map(|(c, _)| *c).unwrap_or(0)
    }

    /// Check if a test is flaky (passed after a failed attempt).
    pub fn is_flaky(&self, id: &TestId) -> bool {
        self.lock()
            .get(id)
            .is_some_and(|&(attempts, successes)| is_flaky(attempts, successes))
    }

    /// All flaky tests, sorted.
    pub fn flaky_tests(&self) -> Vec<TestId> {
        let mut flaky: Vec<TestId> = self
            .lock()
            .iter()
            .filter(|(_, (a, s))| is_flaky(*a, *s))
            .map(|(id, _)| id.clone())
            .collect();
        flaky.sort();
        flaky
    }

    /// Get retry statistics.
    pub fn stats(&self) -> RetryStats {
        let attempts = self.lock();

        let total_tests = attempts.len();
        let total_attempts: usize = attempts.values().map(|(c, _)| *c).sum();
        let flaky_tests = attempts.values().filter(|(a, s)| is_flaky(*a, *s)).count();

        RetryStats {
            total_tests,
            total_attempts,
            total_retries: total_attempts - total_tests,
            flaky_tests,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TestId, (usize, usize)>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn is_flaky(attempts: usize, successes: usize) -> bool {
    attempts > 1 && successes > 0 && successes < attempts
}

/// Statistics about retry attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Number of unique tests that were attempted.
    pub total_tests: usize,
    /// Attempts across all tests, including first runs.
    pub total_attempts: usize,
    /// Attempts beyond each test's first run.
    pub total_retries: usize,
    /// Number of tests identified as flaky.
    pub flaky_tests: usize,
}
