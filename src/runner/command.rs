//! Shell-command unit runner.
//!
//! Runs one shell command per test method and classifies its exit code:
//!
//! | Exit code | Outcome |
//! |-----------|---------|
//! | 0 | passed |
//! | `skip_exit_code` (77) | skipped |
//! | `failure_exit_code` (1) | failed |
//! | anything else, or killed by a signal | error |
//!
//! A method flagged `expect_failure` in the catalog turns any non-zero,
//! non-skip exit into an expected failure, and a zero exit into a
//! failure.
//!
//! Child output is forwarded into the active
//! [`CaptureScope`](crate::capture::CaptureScope), so it is attributed to
//! the method that produced it.
//!
//! # Example Configuration
//!
//! ```toml
//! [runner]
//! discover_command = "cat tests.lst"
//! setup_command = "./fixtures.sh up {suite}"
//! run_command = "python -m pytest {suite}::{method}"
//! ```

use std::process::{Command, Output, Stdio};
use std::sync::Arc;

use tracing::debug;

use super::{Failure, Fixture, Outcome, SuiteFault, UnitRunner};
use crate::capture;
use crate::catalog::{Catalog, CatalogError, Method, Suite};
use crate::config::CommandRunnerConfig;

/// Errors raised while discovering tests through a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("No discover_command configured")]
    NoDiscoverCommand,

    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Discovery command exited with {status}: {stderr}")]
    DiscoveryFailed { status: String, stderr: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Unit runner backed by shell commands.
///
/// Cloning is cheap; clones share the configuration.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    config: Arc<CommandRunnerConfig>,
}

impl CommandRunner {
    pub fn new(config: CommandRunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CommandRunnerConfig {
        &self.config
    }

    /// Runs the discover command and parses its `Suite#method` lines.
    pub fn discover(&self) -> Result<Catalog, CommandError> {
        let script = self
            .config
            .discover_command
            .as_deref()
            .ok_or(CommandError::NoDiscoverCommand)?;

        debug!("Running discovery: {}", script);
        let output = run_script(&self.config, script)?;

        if !output.status.success() {
            return Err(CommandError::DiscoveryFailed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Catalog::from_lines(&String::from_utf8_lossy(&output.stdout))?)
    }
}

impl UnitRunner for CommandRunner {
    type Fixture = CommandFixture;

    fn setup_suite(&self, suite: &Suite) -> Result<(), SuiteFault> {
        if self.config.run_command.is_none() {
            return Err(SuiteFault::Initialization(
                Failure::new("ConfigurationError").with_message("No run_command configured"),
            ));
        }

        let Some(template) = self.config.setup_command.as_deref() else {
            return Ok(());
        };

        let script = render(template, &suite.name, None);
        let output = run_script(&self.config, &script).map_err(|e| {
            SuiteFault::Initialization(Failure::new("SpawnError").with_message(e.to_string()))
        })?;
        forward(&output);

        if output.status.success() {
            Ok(())
        } else {
            Err(SuiteFault::Setup(
                Failure::new("SetupError")
                    .with_message(format!("setup command exited with {}", output.status))
                    .with_stack_trace(String::from_utf8_lossy(&output.stderr).trim_end()),
            ))
        }
    }

    fn instantiate(&self, suite: &Suite) -> Result<CommandFixture, Failure> {
        let template = self.config.run_command.clone().ok_or_else(|| {
            Failure::new("ConfigurationError").with_message("No run_command configured")
        })?;
        Ok(CommandFixture {
            config: self.config.clone(),
            template,
            suite: suite.name.clone(),
        })
    }

    fn teardown_suite(&self, suite: &Suite) -> Result<(), Failure> {
        let Some(template) = self.config.teardown_command.as_deref() else {
            return Ok(());
        };

        let script = render(template, &suite.name, None);
        let output = run_script(&self.config, &script)
            .map_err(|e| Failure::new("SpawnError").with_message(e.to_string()))?;
        forward(&output);

        if output.status.success() {
            Ok(())
        } else {
            Err(Failure::new("TeardownError")
                .with_message(format!("teardown command exited with {}", output.status)))
        }
    }
}

/// One attempt's worth of command state.
pub struct CommandFixture {
    config: Arc<CommandRunnerConfig>,
    template: String,
    suite: String,
}

impl Fixture for CommandFixture {
    fn invoke(&mut self, method: &Method) -> Outcome {
        let script = render(&self.template, &self.suite, Some(&method.name));
        let output = match run_script(&self.config, &script) {
            Ok(output) => output,
            Err(e) => return Outcome::error(Failure::new("SpawnError").with_message(e.to_string())),
        };
        forward(&output);

        classify(&self.config, method, &output)
    }
}

fn classify(config: &CommandRunnerConfig, method: &Method, output: &Output) -> Outcome {
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

    let Some(code) = output.status.code() else {
        return Outcome::error(
            Failure::new("Signal")
                .with_message(format!("{} {}", method.name, output.status))
                .with_stack_trace(stderr),
        );
    };

    if code == config.skip_exit_code {
        return Outcome::skipped();
    }

    if method.expect_failure {
        return if code == 0 {
            Outcome::failed(
                Failure::new("AssertionError")
                    .with_message(format!("{} was expected to fail", method.name)),
            )
        } else {
            Outcome::expected(Failure::new("ExpectedFailure").with_message(format!("exit code {}", code)))
        };
    }

    match code {
        0 => Outcome::passed(),
        c if c == config.failure_exit_code => Outcome::failed(
            Failure::new("AssertionError")
                .with_message(format!("{} exited with code {}", method.name, c))
                .with_stack_trace(stderr),
        ),
        c => Outcome::error(
            Failure::new("CommandError")
                .with_message(format!("{} exited with code {}", method.name, c))
                .with_stack_trace(stderr),
        ),
    }
}

/// Substitutes shell-quoted `{suite}` and `{method}` placeholders.
fn render(template: &str, suite: &str, method: Option<&str>) -> String {
    let rendered = template.replace("{suite}", &shell_words::quote(suite));
    match method {
        Some(method) => rendered.replace("{method}", &shell_words::quote(method)),
        None => rendered,
    }
}

fn run_script(config: &CommandRunnerConfig, script: &str) -> Result<Output, CommandError> {
    let mut cmd = Command::new(&config.shell);
    cmd.arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }

    cmd.output().map_err(|source| CommandError::Spawn {
        command: script.to_string(),
        source,
    })
}

fn forward(output: &Output) {
    if !output.stdout.is_empty() {
        capture::write_stdout(&String::from_utf8_lossy(&output.stdout));
    }
    if !output.stderr.is_empty() {
        capture::write_stderr(&String::from_utf8_lossy(&output.stderr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureScope;
    use crate::runner::TestOutcome;

    fn runner(run_command: &str) -> CommandRunner {
        CommandRunner::new(CommandRunnerConfig {
            run_command: Some(run_command.to_string()),
            ..Default::default()
        })
    }

    fn invoke(runner: &CommandRunner, method: Method) -> (Outcome, capture::Captured) {
        let suite = Suite::new("com.example.Suite", Vec::<String>::new());
        let mut fixture = runner.instantiate(&suite).unwrap();
        let scope = CaptureScope::begin(false);
        let outcome = fixture.invoke(&method);
        (outcome, scope.finish())
    }

    #[test]
    fn test_render_quotes_placeholders() {
        assert_eq!(
            render("run {suite} {method}", "My Suite", Some("it's")),
            "run 'My Suite' 'it'\\''s'"
        );
        assert_eq!(render("setup {suite}", "A", None), "setup A");
    }

    #[test]
    fn test_exit_code_classification() {
        let runner = runner("exit {method}");
        let cases = [
            ("0", TestOutcome::Passed),
            ("1", TestOutcome::Failed),
            ("77", TestOutcome::Skipped),
            ("3", TestOutcome::Error),
        ];
        for (code, expected) in cases {
            let (outcome, _) = invoke(&runner, Method::new(code));
            assert_eq!(outcome.status, expected, "exit {}", code);
        }
    }

    #[test]
    fn test_expected_failure() {
        let runner = runner("exit {method}");
        let (outcome, _) = invoke(&runner, Method::new("2").expecting_failure());
        assert!(outcome.expected_failure);
        assert!(outcome.is_terminal());

        let (outcome, _) = invoke(&runner, Method::new("0").expecting_failure());
        assert_eq!(outcome.status, TestOutcome::Failed);
        assert!(!outcome.expected_failure);
    }

    #[test]
    fn test_child_output_is_captured() {
        let runner = runner("echo out {method}; echo err {method} >&2; exit 1");
        let (outcome, captured) = invoke(&runner, Method::new("m1"));
        assert_eq!(captured.stdout, "out m1\n");
        assert_eq!(captured.stderr, "err m1\n");
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.stack_trace, "err m1");
    }

    #[test]
    fn test_setup_failure_and_missing_run_command() {
        let suite = Suite::new("A", ["m"]);

        let failing = CommandRunner::new(CommandRunnerConfig {
            run_command: Some("true".into()),
            setup_command: Some("exit 4".into()),
            ..Default::default()
        });
        assert!(matches!(failing.setup_suite(&suite), Err(SuiteFault::Setup(_))));

        let unconfigured = CommandRunner::new(CommandRunnerConfig::default());
        assert!(matches!(
            unconfigured.setup_suite(&suite),
            Err(SuiteFault::Initialization(_))
        ));
    }

    #[test]
    fn test_teardown_failure() {
        let runner = CommandRunner::new(CommandRunnerConfig {
            run_command: Some("true".into()),
            teardown_command: Some("exit 2".into()),
            ..Default::default()
        });
        let failure = runner.teardown_suite(&Suite::new("A", ["m"])).unwrap_err();
        assert_eq!(failure.kind, "TeardownError");
    }

    #[test]
    fn test_discover_lines() {
        let runner = CommandRunner::new(CommandRunnerConfig {
            discover_command: Some("printf 'A#m1\\nA#m2\\nB#m3\\n'".into()),
            ..Default::default()
        });
        let catalog = runner.discover().unwrap();
        assert_eq!(catalog.suites().len(), 2);
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.test_id(1, 0).to_string(), "B#m3");
    }

    #[test]
    fn test_discover_failure() {
        let runner = CommandRunner::new(CommandRunnerConfig {
            discover_command: Some("echo nope >&2; exit 3".into()),
            ..Default::default()
        });
        let err = runner.discover().unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(matches!(
            CommandRunner::new(CommandRunnerConfig::default()).discover(),
            Err(CommandError::NoDiscoverCommand)
        ));
    }

    #[test]
    fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let config = CommandRunnerConfig {
            run_command: Some("test -f marker".into()),
            working_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let (outcome, _) = invoke(&CommandRunner::new(config), Method::new("m"));
        assert_eq!(outcome.status, TestOutcome::Passed);
    }
}
