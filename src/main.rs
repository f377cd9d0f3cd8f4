//! shardline CLI - sharded, parallel test orchestrator.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shardline::catalog::{Catalog, load_catalog};
use shardline::config::{self, Config};
use shardline::orchestrator::Orchestrator;
use shardline::plan::ExecutionPlan;
use shardline::report::ConsoleReporter;
use shardline::runner::command::CommandRunner;
use shardline::shard::{ShardSpec, partition};

const DEFAULT_CONFIG: &str = "shardline.toml";

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Sharded, parallel test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: shardline.toml, if present]
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Selection {
    /// Units to run: `Suite` or `Suite#method`. Defaults to everything.
    units: Vec<String>,

    /// Catalog file (.json, .toml, or .txt with `Suite#method` lines).
    /// Without it, the configured discover_command is used.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Shard to run, as INDEX/COUNT (e.g. 0/4)
    #[arg(long)]
    shard: Option<ShardSpec>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Number of worker threads
        #[arg(long)]
        parallel_threads: Option<usize>,

        /// Dispatch individual methods in parallel (needs --default-parallel)
        #[arg(long)]
        parallel_methods: bool,

        /// Treat suites as safe to run in parallel
        #[arg(long)]
        default_parallel: bool,

        /// Re-run failing tests up to N times
        #[arg(long)]
        num_retries: Option<usize>,

        /// Directory receiving per-suite report artifacts
        #[arg(long)]
        outdir: Option<PathBuf>,

        /// Write TEST-<suite>.xml JUnit reports
        #[arg(long)]
        xmlreport: bool,

        /// Echo test output to the console while capturing it
        #[arg(long)]
        stream_output: bool,
    },

    /// List the tests this shard would run
    Collect {
        #[command(flatten)]
        selection: Selection,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Commands::Run {
            selection,
            parallel_threads,
            parallel_methods,
            default_parallel,
            num_retries,
            outdir,
            xmlreport,
            stream_output,
        } => {
            let overrides = RunOverrides {
                parallel_threads,
                parallel_methods,
                default_parallel,
                num_retries,
                outdir,
                xmlreport,
                stream_output,
            };
            run_tests(cli.config.as_deref(), selection, overrides, cli.verbose).await
        }
        Commands::Collect { selection, format } => {
            collect_tests(cli.config.as_deref(), selection, &format)
        }
        Commands::Validate => validate_config(cli.config.as_deref()),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }
}

struct RunOverrides {
    parallel_threads: Option<usize>,
    parallel_methods: bool,
    default_parallel: bool,
    num_retries: Option<usize>,
    outdir: Option<PathBuf>,
    xmlreport: bool,
    stream_output: bool,
}

impl RunOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(threads) = self.parallel_threads {
            config.run.parallel_threads = threads;
        }
        if let Some(retries) = self.num_retries {
            config.run.num_retries = retries;
        }
        if let Some(outdir) = self.outdir {
            config.report.outdir = outdir;
        }
        config.run.parallel_methods |= self.parallel_methods;
        config.run.default_parallel |= self.default_parallel;
        config.run.stream_output |= self.stream_output;
        config.report.xmlreport |= self.xmlreport;
    }
}

/// Loads the given config file, or `shardline.toml` if it exists, or
/// falls back to defaults.
fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            info!("Loaded configuration from {}", DEFAULT_CONFIG);
            config::load_config(Path::new(DEFAULT_CONFIG))
        }
        None => {
            debug!("No {} found, using defaults", DEFAULT_CONFIG);
            Ok(Config::default())
        }
    }
}

/// Loads or discovers the catalog and narrows it to the selected units.
fn resolve_catalog(config: &Config, selection: &Selection) -> Result<Catalog> {
    let catalog = match &selection.catalog {
        Some(path) => load_catalog(path)
            .with_context(|| format!("Failed to load catalog from {}", path.display()))?,
        None => CommandRunner::new(config.runner.clone())
            .discover()
            .context("No --catalog given and test discovery failed")?,
    };

    info!(
        "Catalog has {} suites, {} tests",
        catalog.suites().len(),
        catalog.len()
    );

    catalog
        .select(&selection.units)
        .context("Invalid unit selection")
}

async fn run_tests(
    config_path: Option<&Path>,
    selection: Selection,
    overrides: RunOverrides,
    verbose: bool,
) -> Result<u8> {
    let mut config = load_config(config_path)?;
    overrides.apply(&mut config);
    if let Some(shard) = selection.shard {
        config.run.shard = Some(shard);
    }

    let catalog = resolve_catalog(&config, &selection)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted: finishing running tests, not starting new ones");
                cancel.cancel();
            }
        }
    });

    let runner = CommandRunner::new(config.runner.clone());
    let orchestrator = Orchestrator::new(config, runner, ConsoleReporter::new(verbose))
        .with_cancellation_token(cancel);

    let result = orchestrator.run(&catalog).await?;
    Ok(result.exit_code() as u8)
}

fn collect_tests(config_path: Option<&Path>, selection: Selection, format: &str) -> Result<u8> {
    let config = load_config(config_path)?;
    let shard = selection
        .shard
        .or(config.run.shard)
        .unwrap_or_default();

    let catalog = resolve_catalog(&config, &selection)?;
    let assignment = partition(&catalog, shard);
    let tests: Vec<_> = assignment.test_ids(&catalog).collect();

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&tests)?;
            println!("{}", json);
        }
        _ => {
            println!("Shard {}: {} of {} tests", shard, tests.len(), catalog.len());
            for test in &tests {
                println!("  {}", test);
            }
        }
    }

    Ok(0)
}

fn validate_config(config_path: Option<&Path>) -> Result<u8> {
    let config = load_config(config_path)?;
    let plan = ExecutionPlan::resolve(&config.run);

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Granularity: {}", plan.granularity);
    println!("  Workers: {}", plan.worker_count);
    println!("  Retries: {}", plan.retry_count);
    println!("  Shard: {}", config.run.shard.unwrap_or_default());
    println!(
        "  Run command: {}",
        config.runner.run_command.as_deref().unwrap_or("(none)")
    );
    println!(
        "  XML report: {}",
        if config.report.xmlreport {
            config.report.outdir.display().to_string()
        } else {
            "off".to_string()
        }
    );

    Ok(0)
}
