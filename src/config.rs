//! Configuration loading and schema definitions for shardline.
//!
//! Configuration comes from an optional TOML file; every field has a
//! default, and command-line flags override whatever the file sets.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads shardline configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use shardline::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("shardline.toml"))?;
/// println!("Parallel threads: {}", config.run.parallel_threads);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads shardline configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardline::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     parallel_threads = 4
///     default_parallel = true
///     num_retries = 2
///     shard = "1/3"
///
///     [report]
///     xmlreport = true
/// "#)?;
///
/// assert_eq!(config.run.parallel_threads, 4);
/// assert_eq!(config.run.shard.map(|s| s.count()), Some(3));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
