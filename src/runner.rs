//! The unit-runner seam.
//!
//! The orchestrator never looks inside a test. It asks a [`UnitRunner`]
//! to prepare a suite, to build a fresh [`Fixture`] for every attempt,
//! and to tear the suite down again; the fixture runs one method and
//! reports an [`Outcome`]. How that happens (reflection, a subprocess,
//! a function table) is entirely the runner's business.
//!
//! ```text
//!   setup_suite(suite) ──► Ok / SuiteFault
//!        │
//!        ▼   per attempt
//!   instantiate(suite) ──► Fixture ──► invoke(method) ──► Outcome
//!        │
//!        ▼   after the last assigned method
//!   teardown_suite(suite)
//! ```
//!
//! # Example
//!
//! ```
//! use shardline::catalog::{Method, Suite};
//! use shardline::runner::{Failure, Fixture, Outcome, UnitRunner};
//!
//! struct EvenRunner;
//! struct EvenFixture;
//!
//! impl Fixture for EvenFixture {
//!     fn invoke(&mut self, method: &Method) -> Outcome {
//!         if method.name.len() % 2 == 0 {
//!             Outcome::passed()
//!         } else {
//!             Outcome::failed(Failure::new("AssertionError").with_message("odd name"))
//!         }
//!     }
//! }
//!
//! impl UnitRunner for EvenRunner {
//!     type Fixture = EvenFixture;
//!
//!     fn instantiate(&self, _suite: &Suite) -> Result<EvenFixture, Failure> {
//!         Ok(EvenFixture)
//!     }
//! }
//! ```

pub mod command;

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capture;
use crate::catalog::{Method, Suite, TestId};

/// The outcome status of a test execution.
///
/// | Outcome | Description | Fails the run? |
/// |---------|-------------|----------------|
/// | Passed | Test assertions succeeded | No |
/// | Failed | An assertion did not hold | Yes |
/// | Error | Unexpected exception, setup failure, crash | Yes |
/// | Skipped | Test was intentionally not run | No |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl TestOutcome {
    /// Returns `true` for outcomes that don't fail the run.
    ///
    /// ```
    /// use shardline::runner::TestOutcome;
    ///
    /// assert!(TestOutcome::Passed.is_success());
    /// assert!(TestOutcome::Skipped.is_success());
    /// assert!(!TestOutcome::Failed.is_success());
    /// assert!(!TestOutcome::Error.is_success());
    /// ```
    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed | TestOutcome::Skipped)
    }
}

/// Details of a failure or error, as reported by the unit runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Failure type, e.g. an exception class name.
    pub kind: String,
    /// Human-readable message.
    pub message: Option<String>,
    /// Stack trace or other diagnostic text.
    pub stack_trace: String,
}

impl Failure {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: None,
            stack_trace: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = trace.into();
        self
    }

    /// Converts a caught panic payload into an error record.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Failure::new("panic").with_message(panic_message(&*payload))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

thread_local! {
    static PANIC_ARMED: Cell<bool> = const { Cell::new(false) };
    static LAST_PANIC: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains a process-wide hook in front of the current one. On threads
/// inside [`catch_panic`] it records the location and backtrace and writes
/// the panic message into the active capture scope; everywhere else it
/// defers to the previous hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if !PANIC_ARMED.with(|armed| armed.get()) {
                previous(info);
                return;
            }

            let location = info
                .location()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            let thread = std::thread::current();
            capture::write_stderr(&format!(
                "thread '{}' panicked at {}:\n{}\n",
                thread.name().unwrap_or("<unnamed>"),
                location,
                panic_message(info.payload())
            ));

            let trace = format!("panicked at {}\n{}", location, Backtrace::force_capture());
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(trace));
        }));
    });
}

/// Runs `f`, turning a panic into a `panic` error record whose stack trace
/// holds the panic location and backtrace.
///
/// The panic report goes to the active capture scope instead of the
/// process stderr.
///
/// ```
/// use shardline::runner::catch_panic;
///
/// let failure = catch_panic(|| -> u32 { panic!("kaboom") }).unwrap_err();
/// assert_eq!(failure.message.as_deref(), Some("kaboom"));
/// assert!(failure.stack_trace.starts_with("panicked at"));
/// ```
pub fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, Failure> {
    install_panic_hook();
    LAST_PANIC.with(|slot| slot.borrow_mut().take());

    let was_armed = PANIC_ARMED.with(|armed| armed.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    PANIC_ARMED.with(|armed| armed.set(was_armed));

    result.map_err(|payload| {
        let failure = Failure::from_panic(payload);
        match LAST_PANIC.with(|slot| slot.borrow_mut().take()) {
            Some(trace) => failure.with_stack_trace(trace),
            None => failure,
        }
    })
}

/// What one invocation of one method produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: TestOutcome,
    pub failure: Option<Failure>,
    /// The runner matched the failure against a declared expectation.
    pub expected_failure: bool,
}

impl Outcome {
    pub fn passed() -> Self {
        Self {
            status: TestOutcome::Passed,
            failure: None,
            expected_failure: false,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: TestOutcome::Skipped,
            failure: None,
            expected_failure: false,
        }
    }

    /// An assertion-style failure.
    pub fn failed(failure: Failure) -> Self {
        Self {
            status: TestOutcome::Failed,
            failure: Some(failure),
            expected_failure: false,
        }
    }

    /// An unexpected exception.
    pub fn error(failure: Failure) -> Self {
        Self {
            status: TestOutcome::Error,
            failure: Some(failure),
            expected_failure: false,
        }
    }

    /// A failure that matched the method's declared expectation.
    ///
    /// Terminal on the first attempt and reported as a pass.
    pub fn expected(failure: Failure) -> Self {
        Self {
            status: TestOutcome::Failed,
            failure: Some(failure),
            expected_failure: true,
        }
    }

    /// Returns true if this outcome ends the retry loop.
    pub fn is_terminal(&self) -> bool {
        self.expected_failure || self.status.is_success()
    }
}

/// Why a suite could not be prepared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteFault {
    /// Suite-level setup failed; every assigned method errors with this
    /// failure.
    Setup(Failure),
    /// The runner could not be built for the suite at all; the suite is
    /// reported as a single errored case named after the suite.
    Initialization(Failure),
}

/// One fresh instance of a suite's fixture, used for exactly one attempt.
///
/// Fixtures live on the worker thread that created them and need not be
/// `Send`. Output written through [`crate::capture`] during `invoke` is
/// attributed to the method.
pub trait Fixture {
    /// Runs one method.
    fn invoke(&mut self, method: &Method) -> Outcome;
}

/// The opaque test execution capability.
///
/// Implementations are shared across worker threads. Panics raised by
/// any of these methods are caught and reported as errors.
pub trait UnitRunner: Send + Sync + 'static {
    /// Per-attempt fixture type.
    type Fixture: Fixture;

    /// Suite-level setup, run at most once per suite per run.
    fn setup_suite(&self, _suite: &Suite) -> Result<(), SuiteFault> {
        Ok(())
    }

    /// Builds a fresh fixture. Called once per attempt.
    fn instantiate(&self, suite: &Suite) -> Result<Self::Fixture, Failure>;

    /// Suite-level teardown, run once after the suite's last assigned
    /// method when setup succeeded.
    fn teardown_suite(&self, _suite: &Suite) -> Result<(), Failure> {
        Ok(())
    }
}

/// The terminal result of one test case, ready for aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Suite and case name.
    pub id: TestId,

    /// Declaration position within the suite; orders the suite report.
    pub order: usize,

    pub outcome: TestOutcome,

    /// Present for `Failed` and `Error`.
    pub failure: Option<Failure>,

    /// Elapsed time of the terminal attempt. Zero for skipped cases.
    pub duration: Duration,

    /// Captured standard output of the terminal attempt.
    pub stdout: String,

    /// Captured standard error of the terminal attempt.
    pub stderr: String,

    /// Number of attempts made, including the terminal one.
    pub attempts: usize,

    /// Passed after at least one failed attempt.
    pub flaky: bool,
}

impl CaseResult {
    /// Creates a result with no output, timing or attempts.
    pub fn new(id: TestId, order: usize, outcome: TestOutcome) -> Self {
        Self {
            id,
            order,
            outcome,
            failure: None,
            duration: Duration::ZERO,
            stdout: String::new(),
            stderr: String::new(),
            attempts: 0,
            flaky: false,
        }
    }

    pub fn with_failure(mut self, failure: Failure) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }

    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts;
        self
    }

    /// Skipped cases carry neither timing, output nor failure details.
    pub(crate) fn normalized(mut self) -> Self {
        match self.outcome {
            TestOutcome::Skipped => {
                self.duration = Duration::ZERO;
                self.stdout.clear();
                self.stderr.clear();
                self.failure = None;
            }
            TestOutcome::Passed => self.failure = None,
            TestOutcome::Failed | TestOutcome::Error => {}
        }
        self
    }
}
