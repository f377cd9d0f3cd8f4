//! Work distribution and the worker pool.
//!
//! The shard's assigned methods are grouped into [`Job`]s according to
//! each suite's [`DispatchMode`]:
//!
//! | Mode | Jobs |
//! |------|------|
//! | `Serial` | all serial suites share one job, run in catalog order |
//! | `Suite` | one job per suite |
//! | `Methods` | one job per method |
//!
//! Jobs sit in a FIFO queue in catalog order. [`Scheduler::run`] starts up
//! to `worker_count` workers; each pops the next job, runs it to the end on
//! a blocking thread, then pops again. Completion order is therefore free,
//! dispatch order is not.
//!
//! # Example
//!
//! ```
//! use shardline::catalog::{Catalog, Suite};
//! use shardline::config::RunConfig;
//! use shardline::orchestrator::scheduler::build_jobs;
//! use shardline::plan::ExecutionPlan;
//! use shardline::shard::{partition, ShardSpec};
//!
//! let catalog = Catalog::new(vec![
//!     Suite::new("A", ["m1", "m2"]),
//!     Suite::new("B", ["m3"]),
//! ]);
//! let plan = ExecutionPlan::resolve(&RunConfig {
//!     parallel_threads: 2,
//!     default_parallel: true,
//!     parallel_methods: true,
//!     ..Default::default()
//! });
//!
//! let jobs = build_jobs(&plan, &catalog, &partition(&catalog, ShardSpec::all()));
//! assert_eq!(jobs.len(), 3); // one per method
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::RunError;
use crate::capture::CaptureScope;
use crate::catalog::{Catalog, Suite, TestId};
use crate::plan::{DispatchMode, ExecutionPlan};
use crate::recorder::{InvocationEvent, NullRecorder, Recorder};
use crate::report::ReportAggregator;
use crate::retry::{RetryController, RetryLedger};
use crate::runner::{CaseResult, Failure, SuiteFault, TestOutcome, UnitRunner, catch_panic};
use crate::shard::ShardAssignment;

/// Some methods of one suite, run in order by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    /// Catalog position of the suite.
    pub suite: usize,
    /// Method positions, ascending.
    pub methods: Vec<usize>,
}

/// The unit a worker pulls from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub items: Vec<WorkItem>,
}

impl Job {
    fn single(suite: usize, methods: Vec<usize>) -> Self {
        Self {
            items: vec![WorkItem { suite, methods }],
        }
    }

    /// Number of methods in the job.
    pub fn len(&self) -> usize {
        self.items.iter().map(|i| i.methods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Groups the shard's assigned methods into jobs, in catalog order.
///
/// Suites with nothing assigned produce no job. The serial lane sits at
/// the position of its first suite.
pub fn build_jobs(plan: &ExecutionPlan, catalog: &Catalog, assignment: &ShardAssignment) -> Vec<Job> {
    let mut jobs: Vec<Job> = Vec::new();
    let mut serial_lane: Option<usize> = None;

    for assigned in assignment.suites() {
        if assigned.methods.is_empty() {
            continue;
        }
        let suite = &catalog.suites()[assigned.suite];

        match plan.dispatch_mode(suite) {
            DispatchMode::Serial => {
                let item = WorkItem {
                    suite: assigned.suite,
                    methods: assigned.methods.clone(),
                };
                match serial_lane {
                    Some(lane) => jobs[lane].items.push(item),
                    None => {
                        serial_lane = Some(jobs.len());
                        jobs.push(Job { items: vec![item] });
                    }
                }
            }
            DispatchMode::Suite => jobs.push(Job::single(assigned.suite, assigned.methods.clone())),
            DispatchMode::Methods => jobs.extend(
                assigned
                    .methods
                    .iter()
                    .map(|&m| Job::single(assigned.suite, vec![m])),
            ),
        }
    }

    jobs
}

/// Once-per-run suite lifecycle state.
struct SuiteGate {
    setup: OnceLock<Result<(), SuiteFault>>,
    remaining: AtomicUsize,
    torn_down: AtomicBool,
}

/// Everything a worker needs to run jobs. Shared across workers.
pub struct RunContext<R> {
    catalog: Arc<Catalog>,
    runner: Arc<R>,
    plan: ExecutionPlan,
    aggregator: Arc<ReportAggregator>,
    recorder: Arc<dyn Recorder>,
    ledger: RetryLedger,
    echo: bool,
    gates: Vec<SuiteGate>,
    teardown_failures: Mutex<Vec<(String, Failure)>>,
}

impl<R: UnitRunner> RunContext<R> {
    pub fn new(
        catalog: Arc<Catalog>,
        assignment: &ShardAssignment,
        runner: Arc<R>,
        plan: ExecutionPlan,
        aggregator: Arc<ReportAggregator>,
    ) -> Self {
        let mut gates: Vec<SuiteGate> = (0..catalog.suites().len())
            .map(|_| SuiteGate {
                setup: OnceLock::new(),
                remaining: AtomicUsize::new(0),
                torn_down: AtomicBool::new(false),
            })
            .collect();
        for assigned in assignment.suites() {
            gates[assigned.suite].remaining = AtomicUsize::new(assigned.methods.len());
        }

        Self {
            catalog,
            runner,
            plan,
            aggregator,
            recorder: Arc::new(NullRecorder),
            ledger: RetryLedger::new(),
            echo: false,
            gates,
            teardown_failures: Mutex::new(Vec::new()),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Echo captured output to the console as well.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn aggregator(&self) -> &ReportAggregator {
        &self.aggregator
    }

    /// Suites whose teardown failed, with the failure.
    pub fn teardown_failures(&self) -> Vec<(String, Failure)> {
        self.teardown_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Tears down every suite that was set up but not torn down, e.g.
    /// because the run stopped early. Blocks.
    pub fn sweep_teardowns(&self) {
        for (idx, gate) in self.gates.iter().enumerate() {
            if matches!(gate.setup.get(), Some(Ok(()))) {
                self.teardown(idx);
            }
        }
    }

    fn run_job(&self, job: Job, cancel: &CancellationToken, results: &UnboundedSender<CaseResult>) {
        for (i, item) in job.items.iter().enumerate() {
            if i > 0 && cancel.is_cancelled() {
                debug!("Not dispatching remaining {} suites of serial lane", job.items.len() - i);
                return;
            }
            self.run_item(item, results);
        }
    }

    fn run_item(&self, item: &WorkItem, results: &UnboundedSender<CaseResult>) {
        let suite = &self.catalog.suites()[item.suite];
        let report = |case: CaseResult| {
            if self.aggregator.record(item.suite, case.clone()) {
                let _ = results.send(case);
            }
        };

        if suite.ignored {
            debug!("Suite {} is ignored", suite.name);
            report(CaseResult::new(
                TestId::new(&suite.name, &suite.name),
                0,
                TestOutcome::Skipped,
            ));
            return;
        }

        match self.setup(item.suite, suite) {
            Ok(()) => {
                for &method in &item.methods {
                    let result = RetryController::new(&*self.runner, self.plan.retry_count)
                        .with_recorder(&*self.recorder)
                        .with_ledger(&self.ledger)
                        .with_echo(self.echo)
                        .invoke_with_retry(suite, method);
                    report(result);
                    self.complete_methods(item.suite, 1);
                }
            }
            Err(SuiteFault::Setup(failure)) => {
                for &method in &item.methods {
                    report(
                        CaseResult::new(self.catalog.test_id(item.suite, method), method, TestOutcome::Error)
                            .with_failure(failure.clone()),
                    );
                }
                self.complete_methods(item.suite, item.methods.len());
            }
            Err(SuiteFault::Initialization(failure)) => {
                let case = CaseResult::new(
                    TestId::new(&suite.name, &suite.name),
                    0,
                    TestOutcome::Error,
                )
                .with_failure(failure.clone());
                if self.aggregator.fault_suite(item.suite, case.clone()) {
                    let _ = results.send(case);
                }
                self.complete_methods(item.suite, item.methods.len());
            }
        }
    }

    /// Runs suite setup on first use; later callers wait for and share the
    /// result.
    fn setup(&self, idx: usize, suite: &Suite) -> &Result<(), SuiteFault> {
        self.gates[idx].setup.get_or_init(|| {
            self.recorder.record(InvocationEvent::SuiteSetup {
                suite: suite.name.clone(),
            });

            let scope = CaptureScope::begin(self.echo);
            let start = Instant::now();
            let result = catch_panic(|| self.runner.setup_suite(suite))
                .unwrap_or_else(|failure| Err(SuiteFault::Setup(failure)));
            self.aggregator.record_suite_output(idx, scope.finish(), start.elapsed());

            match &result {
                Ok(()) => debug!("Suite {} set up", suite.name),
                Err(SuiteFault::Setup(f)) => warn!(
                    "Setup of {} failed: {}",
                    suite.name,
                    f.message.as_deref().unwrap_or(&f.kind)
                ),
                Err(SuiteFault::Initialization(f)) => error!(
                    "Could not initialize {}: {}",
                    suite.name,
                    f.message.as_deref().unwrap_or(&f.kind)
                ),
            }
            result
        })
    }

    fn complete_methods(&self, idx: usize, count: usize) {
        let gate = &self.gates[idx];
        let before = gate.remaining.fetch_sub(count, Ordering::AcqRel);
        if before == count && matches!(gate.setup.get(), Some(Ok(()))) {
            self.teardown(idx);
        }
    }

    fn teardown(&self, idx: usize) {
        if self.gates[idx].torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let suite = &self.catalog.suites()[idx];
        self.recorder.record(InvocationEvent::SuiteTeardown {
            suite: suite.name.clone(),
        });

        let scope = CaptureScope::begin(self.echo);
        let start = Instant::now();
        let result = catch_panic(|| self.runner.teardown_suite(suite)).and_then(|r| r);
        self.aggregator.record_trailing_output(idx, scope.finish(), start.elapsed());

        if let Err(failure) = result {
            error!(
                "Teardown of {} failed: {}",
                suite.name,
                failure.message.as_deref().unwrap_or(&failure.kind)
            );
            self.teardown_failures
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((suite.name.clone(), failure));
        }
    }
}

/// Bounded worker pool over a FIFO job queue.
pub struct Scheduler {
    worker_count: usize,
}

impl Scheduler {
    /// Creates a scheduler running at most `worker_count` jobs at once.
    /// Values below 1 are clamped.
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    /// Runs every job unless cancelled, sending terminal results to
    /// `results` as they complete.
    ///
    /// Returns the number of jobs dispatched. Jobs still queued when
    /// `cancel` fires are never started; started jobs always finish.
    pub async fn run<R: UnitRunner>(
        &self,
        jobs: Vec<Job>,
        ctx: Arc<RunContext<R>>,
        results: UnboundedSender<CaseResult>,
        cancel: CancellationToken,
    ) -> Result<usize, RunError> {
        let total = jobs.len();
        let workers = self.worker_count.min(total);
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let dispatched = Arc::new(AtomicUsize::new(0));

        info!("Starting {} workers for {} jobs", workers, total);

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let queue = queue.clone();
            let ctx = ctx.clone();
            let results = results.clone();
            let cancel = cancel.clone();
            let dispatched = dispatched.clone();

            pool.spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!("Worker {} stopping: run cancelled", worker);
                        break;
                    }
                    let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
                    let Some(job) = next else {
                        break;
                    };
                    dispatched.fetch_add(1, Ordering::Relaxed);

                    let ctx = ctx.clone();
                    let results = results.clone();
                    let cancel = cancel.clone();
                    tokio::task::spawn_blocking(move || ctx.run_job(job, &cancel, &results))
                        .await
                        .map_err(|e| RunError::WorkerCrashed(format!("worker {}: {}", worker, e)))?;
                }
                Ok::<(), RunError>(())
            });
        }
        drop(results);

        let mut fatal = None;
        while let Some(joined) = pool.join_next().await {
            let outcome = joined
                .map_err(|e| RunError::WorkerCrashed(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!("{}", e);
                cancel.cancel();
                fatal.get_or_insert(e);
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(dispatched.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::catalog::{Method, SuiteConcurrency};
    use crate::config::RunConfig;
    use crate::runner::{Fixture, Outcome};
    use crate::shard::{ShardSpec, partition};

    fn plan(threads: usize, default_parallel: bool, parallel_methods: bool) -> ExecutionPlan {
        ExecutionPlan::resolve(&RunConfig {
            parallel_threads: threads,
            default_parallel,
            parallel_methods,
            ..Default::default()
        })
    }

    fn catalog() -> Catalog {
        Catalog::new(vec![
            Suite::new("A", ["a1", "a2"]),
            Suite::new("B", ["b1"]),
            Suite::new("C", ["c1", "c2"]).with_concurrency(SuiteConcurrency::Serial),
            Suite::new("D", Vec::<String>::new()),
        ])
    }

    #[test]
    fn test_sequential_is_one_lane() {
        let catalog = catalog();
        let jobs = build_jobs(&plan(1, true, true), &catalog, &partition(&catalog, ShardSpec::all()));
        assert_eq!(jobs.len(), 1);
        let suites: Vec<_> = jobs[0].items.iter().map(|i| i.suite).collect();
        assert_eq!(suites, vec![0, 1, 2]);
        assert_eq!(jobs[0].len(), 5);
    }

    #[test]
    fn test_suite_parallel_keeps_serial_lane() {
        let catalog = catalog();
        let jobs = build_jobs(&plan(4, true, false), &catalog, &partition(&catalog, ShardSpec::all()));
        assert_eq!(
            jobs,
            vec![
                Job::single(0, vec![0, 1]),
                Job::single(1, vec![0]),
                Job::single(2, vec![0, 1]),
            ]
        );
    }

    #[test]
    fn test_method_parallel_splits_methods() {
        let catalog = catalog();
        let jobs = build_jobs(&plan(4, true, true), &catalog, &partition(&catalog, ShardSpec::all()));
        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[0], Job::single(0, vec![0]));
        assert_eq!(jobs[1], Job::single(0, vec![1]));
        assert_eq!(jobs[3], Job::single(2, vec![0, 1]));
    }

    #[test]
    fn test_suite_opt_in_overrides_sequential() {
        let catalog = Catalog::new(vec![
            Suite::new("A", ["a1", "a2"]),
            Suite::new("P", ["p1", "p2"]).with_concurrency(SuiteConcurrency::ParallelMethods),
        ]);
        let jobs = build_jobs(&plan(2, false, false), &catalog, &partition(&catalog, ShardSpec::all()));
        assert_eq!(
            jobs,
            vec![
                Job::single(0, vec![0, 1]),
                Job::single(1, vec![0]),
                Job::single(1, vec![1]),
            ]
        );
    }

    #[test]
    fn test_shard_subset_only() {
        let catalog = catalog();
        let jobs = build_jobs(&plan(4, true, false), &catalog, &partition(&catalog, "1/2".parse().unwrap()));
        // Flattened: a1 a2 b1 c1 c2 -> shard 1 owns a2, c1.
        assert_eq!(jobs, vec![Job::single(0, vec![1]), Job::single(2, vec![0])]);
    }

    /// Sleeps and tracks how many invocations overlap.
    struct SlowRunner {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    struct SlowFixture {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Fixture for SlowFixture {
        fn invoke(&mut self, _method: &Method) -> Outcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Outcome::passed()
        }
    }

    impl UnitRunner for SlowRunner {
        type Fixture = SlowFixture;

        fn instantiate(&self, _suite: &Suite) -> Result<SlowFixture, Failure> {
            Ok(SlowFixture {
                active: self.active.clone(),
                peak: self.peak.clone(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_pool_is_bounded() {
        let methods: Vec<String> = (0..8).map(|i| format!("m{}", i)).collect();
        let catalog = Arc::new(Catalog::new(vec![Suite::new("Slow", methods)]));
        let assignment = partition(&catalog, ShardSpec::all());
        let plan = plan(3, true, true);
        let jobs = build_jobs(&plan, &catalog, &assignment);
        assert_eq!(jobs.len(), 8);

        let peak = Arc::new(AtomicUsize::new(0));
        let runner = Arc::new(SlowRunner {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
        });
        let aggregator = Arc::new(ReportAggregator::new(&catalog, &assignment));
        let ctx = Arc::new(RunContext::new(
            catalog.clone(),
            &assignment,
            runner,
            plan,
            aggregator.clone(),
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatched = Scheduler::new(plan.worker_count)
            .run(jobs, ctx, tx, CancellationToken::new())
            .await
            .unwrap();

        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }

        assert_eq!(dispatched, 8);
        assert_eq!(received, 8);
        assert!(aggregator.is_complete(0));
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {}", peak);
        assert!(peak >= 2, "peak concurrency {}", peak);
    }

    #[tokio::test]
    async fn test_cancelled_run_dispatches_nothing() {
        let catalog = Arc::new(catalog());
        let assignment = partition(&catalog, ShardSpec::all());
        let plan = plan(2, true, false);
        let jobs = build_jobs(&plan, &catalog, &assignment);
        let aggregator = Arc::new(ReportAggregator::new(&catalog, &assignment));
        let ctx = Arc::new(RunContext::new(
            catalog.clone(),
            &assignment,
            Arc::new(SlowRunner {
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }),
            plan,
            aggregator.clone(),
        ));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatched = Scheduler::new(2).run(jobs, ctx, tx, cancel).await.unwrap();

        assert_eq!(dispatched, 0);
        assert_eq!(aggregator.pending(), 5);
    }
}
