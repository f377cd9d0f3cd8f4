//! shardline: a sharded, parallel test orchestrator.
//!
//! Given a catalog of test suites and their methods, shardline decides
//! which methods this shard runs, dispatches them to a bounded worker pool
//! at suite or method granularity, retries flaky failures with a fresh
//! fixture per attempt, captures each attempt's output, and writes one
//! JUnit XML report per suite.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Catalog** ([`catalog`]): Suites and methods in declaration order
//! - **Sharding** ([`shard`]): Index-mod-count partitioning of the catalog
//! - **Plan** ([`plan`]): Granularity, worker count and retry bound
//! - **Runner** ([`runner`]): The opaque seam that actually executes tests
//! - **Retry** ([`retry`]): Per-method attempt loop and flakiness stats
//! - **Capture** ([`capture`]): Thread-scoped stdout/stderr capture
//! - **Orchestrator** ([`orchestrator`]): Worker pool and run coordination
//! - **Report** ([`report`]): Result aggregation, JUnit XML, console output
//!
//! # Example
//!
//! ```no_run
//! use shardline::catalog::{Catalog, Method, Suite};
//! use shardline::config::Config;
//! use shardline::orchestrator::Orchestrator;
//! use shardline::report::NullReporter;
//! use shardline::runner::{Failure, Fixture, Outcome, UnitRunner};
//!
//! struct AlwaysPass;
//! struct Noop;
//!
//! impl Fixture for Noop {
//!     fn invoke(&mut self, method: &Method) -> Outcome {
//!         shardline::capture_println!("running {}", method.name);
//!         Outcome::passed()
//!     }
//! }
//!
//! impl UnitRunner for AlwaysPass {
//!     type Fixture = Noop;
//!     fn instantiate(&self, _suite: &Suite) -> Result<Noop, Failure> {
//!         Ok(Noop)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let catalog = Catalog::new(vec![Suite::new("MathTest", ["add", "sub"])]);
//!     let orchestrator = Orchestrator::new(Config::default(), AlwaysPass, NullReporter);
//!     let result = orchestrator.run(&catalog).await?;
//!     assert!(result.success());
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod catalog;
pub mod config;
pub mod orchestrator;
pub mod plan;
pub mod recorder;
pub mod report;
pub mod retry;
pub mod runner;
pub mod shard;

// Re-export commonly used types
pub use catalog::{Catalog, Method, Suite, TestId};
pub use config::{Config, load_config};
pub use orchestrator::{Orchestrator, RunError, RunResult};
pub use plan::{ExecutionPlan, Granularity};
pub use report::Reporter;
pub use runner::{CaseResult, Fixture, Outcome, TestOutcome, UnitRunner};
pub use shard::{ShardSpec, partition};
