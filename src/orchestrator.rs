//! Test execution engine and orchestration.
//!
//! This module coordinates a run: it narrows the catalog to this shard,
//! resolves the execution plan, hands jobs to the worker pool, and turns
//! the aggregated results into reports.
//!
//! # Architecture
//!
//! ```text
//!    Catalog
//!       │
//!       │ partition(shard)
//!       ▼
//!  ShardAssignment ──► ExecutionPlan::resolve(run config)
//!       │                      │
//!       └──────┬───────────────┘
//!              ▼
//!         build_jobs() ──► Scheduler (JoinSet of workers)
//!                                │  spawn_blocking per job
//!                                ▼
//!                  RetryController ∘ UnitRunner ∘ CaptureScope
//!                                │
//!                 ┌──────────────┴──────────────┐
//!                 ▼                             ▼
//!         ReportAggregator                  Reporter
//!                 │                     (live progress)
//!                 ▼
//!     SuiteReport ──► JunitWriter (TEST-<suite>.xml, .out.txt, .err.txt)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shardline::catalog::load_catalog;
//! use shardline::config::load_config;
//! use shardline::orchestrator::Orchestrator;
//! use shardline::report::ConsoleReporter;
//! use shardline::runner::command::CommandRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("shardline.toml"))?;
//!     let catalog = load_catalog(std::path::Path::new("catalog.json"))?;
//!
//!     let runner = CommandRunner::new(config.runner.clone());
//!     let orchestrator = Orchestrator::new(config, runner, ConsoleReporter::new(false));
//!     let result = orchestrator.run(&catalog).await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::plan::ExecutionPlan;
use crate::recorder::{NullRecorder, Recorder};
use crate::report::{JunitWriter, ReportAggregator, Reporter, SuiteReport};
use crate::runner::{CaseResult, Failure, TestOutcome, UnitRunner};
use crate::shard::partition;

pub use scheduler::{Job, RunContext, Scheduler, WorkItem, build_jobs};

/// Faults that abort a whole run.
///
/// Test failures are never a `RunError`; they end up in [`RunResult`].
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// A worker task died outside of any test attempt.
    #[error("Worker pool failed: {0}")]
    WorkerCrashed(String),

    /// Report artifacts could not be written.
    #[error("Failed to write report artifacts: {0}")]
    Report(String),
}

/// Aggregated results of an entire test run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed or was skipped |
/// | 1 | Some test failed or errored, wasn't run, or a suite teardown failed |
///
/// Fatal faults surface as [`RunError`] instead; the binary maps them to 2.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Number of test cases this shard was responsible for.
    pub total_tests: usize,

    /// Number of tests that passed, including expected failures and
    /// flaky tests.
    pub passed: usize,

    /// Number of tests whose terminal outcome is an assertion failure.
    pub failed: usize,

    /// Number of tests whose terminal outcome is an error.
    pub errors: usize,

    pub skipped: usize,

    /// Number of tests that passed only after a retry.
    pub flaky: usize,

    /// Number of tests that never got a terminal outcome, e.g. because
    /// the run was stopped early.
    pub not_run: usize,

    /// Attempts beyond each test's first.
    pub retries: usize,

    /// Wall-clock duration of the entire test run.
    pub duration: Duration,

    /// Completed suite reports in catalog order.
    pub suites: Vec<SuiteReport>,

    /// Suites whose teardown failed.
    pub suite_failures: Vec<(String, Failure)>,

    /// Files written to the output directory.
    pub artifacts: Vec<PathBuf>,
}

impl RunResult {
    /// Returns `true` if the test run was successful.
    ///
    /// # Example
    ///
    /// ```
    /// use shardline::orchestrator::RunResult;
    /// use std::time::Duration;
    ///
    /// let result = RunResult {
    ///     total_tests: 100,
    ///     passed: 95,
    ///     failed: 0,
    ///     errors: 0,
    ///     skipped: 5,
    ///     flaky: 2,
    ///     not_run: 0,
    ///     retries: 3,
    ///     duration: Duration::from_secs(60),
    ///     suites: vec![],
    ///     suite_failures: vec![],
    ///     artifacts: vec![],
    /// };
    ///
    /// assert!(result.success());
    /// assert_eq!(result.exit_code(), 0);
    /// ```
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errors == 0 && self.not_run == 0 && self.suite_failures.is_empty()
    }

    /// Returns an appropriate process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

#[derive(Default)]
struct Tally {
    cases: usize,
    passed: usize,
    failed: usize,
    errors: usize,
    skipped: usize,
    flaky: usize,
}

impl Tally {
    fn add(&mut self, case: &CaseResult) {
        self.cases += 1;
        match case.outcome {
            TestOutcome::Passed => self.passed += 1,
            TestOutcome::Failed => self.failed += 1,
            TestOutcome::Error => self.errors += 1,
            TestOutcome::Skipped => self.skipped += 1,
        }
        if case.flaky {
            self.flaky += 1;
        }
    }
}

/// The main orchestrator that coordinates test execution.
///
/// # Type Parameters
///
/// - `U`: The unit runner executing individual methods
/// - `R`: The reporter receiving live events
pub struct Orchestrator<U, R> {
    config: Config,
    runner: Arc<U>,
    reporter: R,
    recorder: Arc<dyn Recorder>,
    cancel: CancellationToken,
}

impl<U, R> Orchestrator<U, R>
where
    U: UnitRunner,
    R: Reporter,
{
    pub fn new(config: Config, runner: U, reporter: R) -> Self {
        Self {
            config,
            runner: Arc::new(runner),
            reporter,
            recorder: Arc::new(NullRecorder),
            cancel: CancellationToken::new(),
        }
    }

    /// Reports every fixture instantiation, invocation and suite lifecycle
    /// call to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Stops dispatching new jobs once `token` is cancelled. Jobs already
    /// running finish normally.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs this shard's part of `catalog` and returns the aggregated
    /// results.
    ///
    /// # Errors
    ///
    /// Returns a [`RunError`] only for faults outside the tests themselves.
    pub async fn run(&self, catalog: &Catalog) -> Result<RunResult, RunError> {
        let start = Instant::now();

        let catalog = Arc::new(catalog.clone());
        let shard = self.config.run.shard.unwrap_or_default();
        let assignment = partition(&catalog, shard);
        let plan = ExecutionPlan::resolve(&self.config.run);

        info!(
            "Shard {} owns {} of {} tests",
            shard,
            assignment.len(),
            catalog.len()
        );
        info!(
            "Running {} with {} workers, up to {} retries",
            plan.granularity, plan.worker_count, plan.retry_count
        );
        self.reporter.on_plan_resolved(&plan, assignment.len()).await;

        let aggregator = Arc::new(ReportAggregator::new(&catalog, &assignment));
        let ctx = Arc::new(
            RunContext::new(
                catalog.clone(),
                &assignment,
                self.runner.clone(),
                plan,
                aggregator.clone(),
            )
            .with_recorder(self.recorder.clone())
            .with_echo(self.config.run.stream_output),
        );
        let jobs = build_jobs(&plan, &catalog, &assignment);
        let job_count = jobs.len();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(plan.worker_count);
        let handle = tokio::spawn({
            let ctx = ctx.clone();
            let cancel = self.cancel.clone();
            async move { scheduler.run(jobs, ctx, tx, cancel).await }
        });

        let mut tally = Tally::default();
        while let Some(case) = rx.recv().await {
            tally.add(&case);
            self.reporter.on_case_complete(&case).await;
        }

        let scheduled = handle
            .await
            .map_err(|e| RunError::WorkerCrashed(e.to_string()))
            .and_then(|r| r);

        // Suites that were set up are torn down even if the pool failed.
        let sweeper = ctx.clone();
        let swept = tokio::task::spawn_blocking(move || sweeper.sweep_teardowns())
            .await
            .map_err(|e| RunError::WorkerCrashed(e.to_string()));

        let dispatched = scheduled?;
        swept?;
        debug!("Dispatched {} of {} jobs", dispatched, job_count);

        let not_run = aggregator.pending();
        if not_run > 0 {
            warn!(
                "{} tests were not run; incomplete suites: {}",
                not_run,
                aggregator.incomplete_suites().join(", ")
            );
        }

        let suites = aggregator.snapshots();
        let artifacts = if self.config.report.xmlreport {
            self.write_reports(&suites)?
        } else {
            Vec::new()
        };

        let stats = ctx.ledger().stats();
        let result = RunResult {
            total_tests: tally.cases + not_run,
            passed: tally.passed,
            failed: tally.failed,
            errors: tally.errors,
            skipped: tally.skipped,
            flaky: tally.flaky,
            not_run,
            retries: stats.total_retries,
            duration: start.elapsed(),
            suites,
            suite_failures: ctx.teardown_failures(),
            artifacts,
        };

        self.reporter.on_run_complete(&result).await;

        Ok(result)
    }

    fn write_reports(&self, suites: &[SuiteReport]) -> Result<Vec<PathBuf>, RunError> {
        let writer = JunitWriter::new(&self.config.report.outdir)
            .with_output_files(self.config.report.output_files);

        let mut written = Vec::new();
        for suite in suites {
            let paths = writer
                .write_suite(suite)
                .map_err(|e| RunError::Report(format!("{:#}", e)))?;
            written.extend(paths);
        }
        info!(
            "Wrote {} suite reports to {}",
            suites.len(),
            writer.outdir().display()
        );
        Ok(written)
    }
}
