//! Configuration schema definitions for shardline.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig             - Sharding, parallelism and retry policy inputs
//! ├── CommandRunnerConfig   - Shell commands used by the command unit runner
//! └── ReportConfig          - Output directory and report artifacts
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shard::ShardSpec;

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// parallel_threads = 4
/// default_parallel = true
/// parallel_methods = false
/// num_retries = 2
/// shard = "0/2"
///
/// [runner]
/// run_command = "./gradlew test --tests {suite}.{method}"
///
/// [report]
/// outdir = "test-results"
/// xmlreport = true
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Execution policy inputs.
    #[serde(default)]
    pub run: RunConfig,

    /// Command unit runner settings.
    #[serde(default)]
    pub runner: CommandRunnerConfig,

    /// Report output settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Raw execution policy inputs, resolved into an
/// [`ExecutionPlan`](crate::plan::ExecutionPlan) before a run.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `parallel_threads` | 1 |
/// | `parallel_methods` | false |
/// | `default_parallel` | false |
/// | `num_retries` | 0 |
/// | `shard` | None (run everything) |
/// | `stream_output` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Number of worker threads. Values below 1 are treated as 1.
    #[serde(default = "default_parallel_threads")]
    pub parallel_threads: usize,

    /// Dispatch individual methods instead of whole suites.
    ///
    /// Only honored together with `default_parallel`.
    #[serde(default)]
    pub parallel_methods: bool,

    /// Treat suites as safe to run concurrently unless they opt out.
    #[serde(default)]
    pub default_parallel: bool,

    /// How many times a failing method is re-run before its failure
    /// becomes final.
    #[serde(default)]
    pub num_retries: usize,

    /// Shard of the catalog to execute, as `"<index>/<count>"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardSpec>,

    /// Echo captured output to the console while it is being captured.
    ///
    /// Output is still attributed to the test in the report. With several
    /// workers, echoed lines from different tests may interleave.
    #[serde(default)]
    pub stream_output: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel_threads: default_parallel_threads(),
            parallel_methods: false,
            default_parallel: false,
            num_retries: 0,
            shard: None,
            stream_output: false,
        }
    }
}

fn default_parallel_threads() -> usize {
    1
}

/// Settings for [`CommandRunner`](crate::runner::command::CommandRunner).
///
/// Commands run through `shell -c`. `{suite}` and `{method}` placeholders
/// are replaced with shell-quoted identifiers.
///
/// # Example
///
/// ```toml
/// [runner]
/// discover_command = "./list-tests.sh"
/// setup_command = "./fixtures.sh up {suite}"
/// run_command = "./run-one.sh {suite} {method}"
/// teardown_command = "./fixtures.sh down {suite}"
/// skip_exit_code = 77
/// failure_exit_code = 1
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandRunnerConfig {
    /// Command printing `Suite#method` lines, used when no catalog file
    /// is given.
    pub discover_command: Option<String>,

    /// Command executing a single method.
    pub run_command: Option<String>,

    /// Command run once per suite before its first method.
    pub setup_command: Option<String>,

    /// Command run once per suite after its last method.
    pub teardown_command: Option<String>,

    /// Working directory for all commands.
    pub working_dir: Option<PathBuf>,

    /// Shell used to interpret commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Exit code meaning "skipped".
    #[serde(default = "default_skip_exit_code")]
    pub skip_exit_code: i32,

    /// Exit code meaning "assertion failure"; any other non-zero code is
    /// an error.
    #[serde(default = "default_failure_exit_code")]
    pub failure_exit_code: i32,
}

impl Default for CommandRunnerConfig {
    fn default() -> Self {
        Self {
            discover_command: None,
            run_command: None,
            setup_command: None,
            teardown_command: None,
            working_dir: None,
            shell: default_shell(),
            skip_exit_code: default_skip_exit_code(),
            failure_exit_code: default_failure_exit_code(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_skip_exit_code() -> i32 {
    77
}

fn default_failure_exit_code() -> i32 {
    1
}

/// Report artifact settings.
///
/// # Example
///
/// ```toml
/// [report]
/// outdir = "build/test-results"
/// xmlreport = true
/// output_files = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory receiving per-suite artifacts. Created if missing.
    ///
    /// Default: `"test-results"`
    #[serde(default = "default_outdir")]
    pub outdir: PathBuf,

    /// Write one `TEST-<suite>.xml` JUnit document per suite.
    ///
    /// Default: `false`
    #[serde(default)]
    pub xmlreport: bool,

    /// Write `<suite>.out.txt` and `<suite>.err.txt` with captured output.
    ///
    /// Only takes effect when `xmlreport` is enabled.
    ///
    /// Default: `true`
    #[serde(default = "default_true")]
    pub output_files: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            outdir: default_outdir(),
            xmlreport: false,
            output_files: true,
        }
    }
}

fn default_outdir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}
