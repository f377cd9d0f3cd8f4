//! Execution policy resolution.
//!
//! Turns raw [`RunConfig`] flags into an immutable [`ExecutionPlan`]:
//! which granularity units are dispatched at, how many workers run them,
//! and how often a failing method is retried.
//!
//! Method-level dispatch is opt-in. Splitting a suite's methods across
//! threads is only safe when the suite's fixtures tolerate it, so it
//! requires both `default_parallel` and `parallel_methods` (or a per-suite
//! opt-in). Everything else runs suites as atomic units.
//!
//! | `parallel_threads` | `default_parallel` | `parallel_methods` | Granularity |
//! |---|---|---|---|
//! | ≤ 1 | any | any | `Sequential` |
//! | ≥ 2 | false | any | `Sequential` |
//! | ≥ 2 | true | false | `SuiteParallel` |
//! | ≥ 2 | true | true | `MethodParallel` |

use std::fmt;

use serde::Serialize;
use tracing::warn;

use crate::catalog::{Suite, SuiteConcurrency};
use crate::config::RunConfig;

/// Unit of parallel dispatch for suites without an opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One unit at a time.
    Sequential,
    /// Whole suites run concurrently.
    SuiteParallel,
    /// Individual methods run concurrently.
    MethodParallel,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Granularity::Sequential => "sequential",
            Granularity::SuiteParallel => "suite-parallel",
            Granularity::MethodParallel => "method-parallel",
        };
        f.write_str(s)
    }
}

/// How a particular suite is handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Queued in the serial lane: one unit at a time, catalog order.
    Serial,
    /// Dispatched as one atomic unit that may run alongside others.
    Suite,
    /// Each method dispatched as its own unit.
    Methods,
}

/// The resolved, immutable plan for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Default granularity.
    pub granularity: Granularity,
    /// Worker pool size, at least 1.
    pub worker_count: usize,
    /// Maximum number of re-runs per failing method.
    pub retry_count: usize,
}

impl ExecutionPlan {
    /// Resolves a plan from run configuration.
    ///
    /// # Example
    ///
    /// ```
    /// use shardline::config::RunConfig;
    /// use shardline::plan::{ExecutionPlan, Granularity};
    ///
    /// let config = RunConfig {
    ///     parallel_threads: 4,
    ///     default_parallel: true,
    ///     ..Default::default()
    /// };
    /// let plan = ExecutionPlan::resolve(&config);
    /// assert_eq!(plan.granularity, Granularity::SuiteParallel);
    /// assert_eq!(plan.worker_count, 4);
    /// ```
    pub fn resolve(config: &RunConfig) -> Self {
        let worker_count = config.parallel_threads.max(1);

        let granularity = if worker_count < 2 {
            Granularity::Sequential
        } else if config.default_parallel && config.parallel_methods {
            Granularity::MethodParallel
        } else if config.default_parallel {
            Granularity::SuiteParallel
        } else {
            Granularity::Sequential
        };

        if config.parallel_methods && !config.default_parallel {
            warn!("parallel_methods has no effect without default_parallel");
        }

        Self {
            granularity,
            worker_count,
            retry_count: config.num_retries,
        }
    }

    /// Returns how `suite` is dispatched under this plan.
    ///
    /// A single worker serializes everything. Otherwise a suite's own
    /// concurrency opt-in wins over the plan's granularity. Ignored suites
    /// never split into methods.
    pub fn dispatch_mode(&self, suite: &Suite) -> DispatchMode {
        if self.worker_count < 2 {
            return DispatchMode::Serial;
        }

        let mode = match suite.concurrency {
            Some(SuiteConcurrency::Serial) => DispatchMode::Serial,
            Some(SuiteConcurrency::Parallel) => DispatchMode::Suite,
            Some(SuiteConcurrency::ParallelMethods) => DispatchMode::Methods,
            None => match self.granularity {
                Granularity::Sequential => DispatchMode::Serial,
                Granularity::SuiteParallel => DispatchMode::Suite,
                Granularity::MethodParallel => DispatchMode::Methods,
            },
        };

        if suite.ignored && mode == DispatchMode::Methods {
            DispatchMode::Suite
        } else {
            mode
        }
    }
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self::resolve(&RunConfig::default())
    }
}
