//! Test reporting and output generation.
//!
//! Results flow through two channels. The [`ReportAggregator`] owns the
//! per-suite documents that end up as JUnit XML; [`Reporter`]s get live
//! events for progress display and summaries.

pub mod aggregator;
pub mod junit;

use async_trait::async_trait;

pub use aggregator::{ReportAggregator, SuiteReport, TestCaseReport};
pub use junit::{JunitWriter, to_xml};

use crate::orchestrator::RunResult;
use crate::plan::ExecutionPlan;
use crate::runner::{CaseResult, TestOutcome};

/// A test reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the plan is resolved and the shard's tests are known.
    async fn on_plan_resolved(&self, plan: &ExecutionPlan, assigned: usize);

    /// Called when a test case reaches its terminal outcome.
    async fn on_case_complete(&self, result: &CaseResult);

    /// Called when all tests have completed.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_plan_resolved(&self, _plan: &ExecutionPlan, _assigned: usize) {}
    async fn on_case_complete(&self, _result: &CaseResult) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_plan_resolved(&self, plan: &ExecutionPlan, assigned: usize) {
        for reporter in &self.reporters {
            reporter.on_plan_resolved(plan, assigned).await;
        }
    }

    async fn on_case_complete(&self, result: &CaseResult) {
        for reporter in &self.reporters {
            reporter.on_case_complete(result).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter that shows progress in the terminal.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Option<indicatif::ProgressBar>> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_plan_resolved(&self, plan: &ExecutionPlan, assigned: usize) {
        println!(
            "Running {} tests ({}, {} workers, {} retries)",
            assigned, plan.granularity, plan.worker_count, plan.retry_count
        );

        let pb = indicatif::ProgressBar::new(assigned as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        *self.progress() = Some(pb);
    }

    async fn on_case_complete(&self, result: &CaseResult) {
        let status = match result.outcome {
            TestOutcome::Passed if result.flaky => console::style("FLAKY").yellow(),
            TestOutcome::Passed => console::style("PASS ").green(),
            TestOutcome::Failed => console::style("FAIL ").red(),
            TestOutcome::Skipped => console::style("SKIP ").yellow(),
            TestOutcome::Error => console::style("ERR  ").red().bold(),
        };
        let line = format!("{} {}", status, result.id);
        let show = self.verbose || result.outcome != TestOutcome::Passed || result.flaky;

        match self.progress().as_ref() {
            Some(pb) => {
                pb.inc(1);
                if show {
                    pb.println(line);
                }
            }
            None if show => println!("{}", line),
            None => {}
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Some(pb) = self.progress().take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:   {}", result.total_tests);
        println!("  Passed:  {}", console::style(result.passed).green());
        println!("  Failed:  {}", console::style(result.failed).red());
        println!("  Errors:  {}", console::style(result.errors).red());
        println!("  Skipped: {}", console::style(result.skipped).yellow());

        if result.not_run > 0 {
            println!("  Not Run: {}", console::style(result.not_run).red().bold());
        }

        if result.flaky > 0 {
            println!(
                "  Flaky:   {} ({} retries)",
                console::style(result.flaky).yellow(),
                result.retries
            );
        }

        println!("  Duration: {:?}", result.duration);

        for path in &result.artifacts {
            if path.extension().is_some_and(|ext| ext == "xml") {
                println!("  Report:  {}", console::style(path.display()).dim());
            }
        }

        if result.success() {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }

        println!();
        if result.not_run > 0 && result.failed == 0 && result.errors == 0 {
            println!(
                "{}",
                console::style("Run stopped before every test was dispatched.")
                    .red()
                    .bold()
            );
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }

        let failing: Vec<_> = result
            .suites
            .iter()
            .flat_map(|suite| suite.cases.iter())
            .filter(|case| !case.outcome.is_success())
            .collect();
        if !failing.is_empty() {
            println!();
            println!("Failed tests:");
            for case in failing {
                println!("  - {}#{}", case.classname, case.name);
                if let Some(msg) = case.failure.as_ref().and_then(|f| f.message.as_ref()) {
                    println!("    {}", console::style(msg).dim());
                }
            }
        }

        for (suite, failure) in &result.suite_failures {
            println!(
                "  - {} teardown: {}",
                suite,
                console::style(failure.message.as_deref().unwrap_or(&failure.kind)).dim()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalog::TestId;

    #[derive(Clone, Default)]
    struct Counting {
        planned: Arc<AtomicUsize>,
        cases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reporter for Counting {
        async fn on_plan_resolved(&self, _plan: &ExecutionPlan, assigned: usize) {
            self.planned.fetch_add(assigned, Ordering::SeqCst);
        }

        async fn on_case_complete(&self, _result: &CaseResult) {
            self.cases.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_run_complete(&self, _result: &RunResult) {}
    }

    #[test]
    fn test_multi_reporter_fans_out() {
        let first = Counting::default();
        let second = Counting::default();
        let multi = MultiReporter::new()
            .with_reporter(first.clone())
            .with_reporter(NullReporter)
            .with_reporter(second.clone());

        tokio_test::block_on(async {
            multi.on_plan_resolved(&ExecutionPlan::default(), 3).await;
            let case = CaseResult::new(TestId::new("A", "m"), 0, TestOutcome::Passed);
            multi.on_case_complete(&case).await;
            multi.on_case_complete(&case).await;
        });

        for reporter in [&first, &second] {
            assert_eq!(reporter.planned.load(Ordering::SeqCst), 3);
            assert_eq!(reporter.cases.load(Ordering::SeqCst), 2);
        }
    }
}
