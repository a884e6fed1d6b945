//! rendercache CLI - Operator Command Line Interface
//!
//! Opens a cache directory directly (the owning process must be stopped, the
//! directory lock rejects a second instance) and inspects or maintains it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rendercache_common::{CacheKey, CacheOptions, MB};
use rendercache_storage::DiskCache;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rendercache-cli")]
#[command(about = "rendercache operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rendercache/rendercache.toml")]
    config: String,

    /// Cache directory (overrides the config file)
    #[arg(long, env = "RENDERCACHE_LOCATION")]
    cache_location: Option<PathBuf>,

    /// Shard count the directory was created with
    #[arg(long)]
    shards: Option<u32>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show per-shard entry counts and sizes
    Stats,
    /// Run one eviction sweep
    Sweep,
    /// Re-scan every folder from disk and report drift
    Verify,
    /// Show where a key is stored
    Resolve {
        /// Cache key
        key: String,
    },
    /// List issues found while opening and loading the cache
    Issues,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    cache: CacheOptions,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
    /// Emit JSON log lines instead of text
    #[serde(default)]
    json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &str) -> Config {
    if !Path::new(path).exists() {
        return Config::default();
    }
    match std::fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file {path}: {e}");
            Config::default()
        }),
        Err(e) => {
            eprintln!("Warning: Failed to read config file {path}: {e}");
            Config::default()
        }
    }
}

/// Apply command-line overrides on top of the config file (CLI takes precedence)
fn merge_options(mut options: CacheOptions, args: &Args) -> Result<CacheOptions> {
    if let Some(location) = &args.cache_location {
        options.cache_location = location.clone();
    }
    if let Some(shards) = args.shards {
        options.database_shards = shards;
    }
    if options.cache_location.as_os_str().is_empty() {
        anyhow::bail!("No cache directory given. Use --cache-location or set cache.cache_location");
    }
    options.cache_location = std::path::absolute(&options.cache_location)
        .with_context(|| format!("invalid cache location {:?}", options.cache_location))?;
    Ok(options)
}

fn resolve_log_level(args: &Args, logging: &LoggingConfig) -> String {
    args.log_level
        .clone()
        .unwrap_or_else(|| logging.level.clone())
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_shards(cache: &DiskCache) -> Result<()> {
    let store = Arc::clone(cache.store());
    tokio::task::spawn_blocking(move || store.load_all())
        .await
        .context("shard load task failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config);

    let log_level = resolve_log_level(&args, &config.logging);
    init_logging(&log_level, config.logging.json);

    let options = merge_options(config.cache, &args)?;
    debug!("Config file: {}", args.config);
    info!(
        "Opening cache at {:?} ({} shards, {} MB budget)",
        options.cache_location, options.database_shards, options.cache_size_mb
    );

    let cache = DiskCache::open(options)
        .with_context(|| "failed to open cache directory".to_string())?;

    match args.command {
        Commands::Stats => {
            load_shards(&cache).await?;
            let shards = cache.shard_stats();
            if args.json {
                print_json(&serde_json::json!({
                    "total_bytes": cache.total_cache_bytes(),
                    "budget_bytes": cache.options().cache_size_mb * MB,
                    "shards": shards,
                }))?;
            } else {
                println!("Cache: {}", cache.store().root().display());
                println!(
                    "Size: {} / {} MB",
                    cache.total_cache_bytes() / MB,
                    cache.options().cache_size_mb
                );
                println!();
                println!(
                    "{:<8} {:>10} {:>14} {:>8} {:>10} {:>8}",
                    "SHARD", "ENTRIES", "BYTES", "FOLDERS", "LOG RECS", "STATE"
                );
                for shard in &shards {
                    let state = if shard.degraded { "degraded" } else { "ok" };
                    println!(
                        "{:<8} {:>10} {:>14} {:>8} {:>10} {:>8}",
                        shard.shard,
                        shard.entries,
                        shard.bytes,
                        shard.folders,
                        shard.log_records,
                        state
                    );
                }
            }
        }
        Commands::Sweep => {
            let report = cache.sweep().await?;
            if args.json {
                print_json(&report)?;
            } else {
                println!("Sweep complete");
                println!("  Before:  {} bytes", report.bytes_before);
                println!("  After:   {} bytes", report.bytes_after);
                println!(
                    "  Freed:   {} bytes in {} entries",
                    report.bytes_freed, report.entries_evicted
                );
                if report.stopped_at_min_age {
                    println!("  Stopped early: remaining entries are younger than the minimum age");
                }
            }
        }
        Commands::Verify => {
            let reports = cache.verify().await?;
            if args.json {
                print_json(&reports)?;
            } else {
                println!(
                    "{:<8} {:>10} {:>10} {:>10} {:>10}",
                    "SHARD", "BEFORE", "AFTER", "VANISHED", "MODIFIED"
                );
                for report in &reports {
                    println!(
                        "{:<8} {:>10} {:>10} {:>10} {:>10}",
                        report.shard,
                        report.indexed_before,
                        report.indexed_after,
                        report.vanished,
                        report.modified
                    );
                }
                let drifted: usize = reports.iter().map(|r| r.vanished + r.modified).sum();
                println!();
                println!("{drifted} drifted entries corrected");
            }
        }
        Commands::Resolve { key } => {
            let key = CacheKey::new(key);
            let shard = cache.resolve(&key);
            let relative = cache.relative_path(&key);
            let physical = cache
                .store()
                .shard(shard)
                .context("resolved shard out of range")?
                .index()
                .physical_path(&relative)?;
            if args.json {
                print_json(&serde_json::json!({
                    "key": key,
                    "shard": shard,
                    "relative_path": relative,
                    "path": physical,
                }))?;
            } else {
                println!("Key:   {key}");
                println!("Shard: {shard}");
                println!("Path:  {}", physical.display());
            }
        }
        Commands::Issues => {
            load_shards(&cache).await?;
            let issues = cache.issues();
            if args.json {
                print_json(&issues)?;
            } else if issues.is_empty() {
                println!("No issues");
            } else {
                for issue in &issues {
                    println!("{issue}");
                }
            }
        }
    }

    cache.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["rendercache-cli"];
        argv.extend_from_slice(extra);
        argv.push("stats");
        Args::parse_from(argv)
    }

    #[test]
    fn flags_override_config_file() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            cache_location = "/var/cache/render"
            database_shards = 16
            cache_size_mb = 2048

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");

        let options = merge_options(config.cache, &args(&["--shards", "4"])).unwrap();
        assert_eq!(options.database_shards, 4);
        assert_eq!(options.cache_size_mb, 2048);
        assert_eq!(options.cache_location, PathBuf::from("/var/cache/render"));
    }

    #[test]
    fn explicit_log_level_wins_over_config() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            json: false,
        };
        assert_eq!(resolve_log_level(&args(&["--log-level", "warn"]), &logging), "warn");
        assert_eq!(resolve_log_level(&args(&[]), &logging), "debug");
        assert_eq!(resolve_log_level(&args(&[]), &LoggingConfig::default()), "warn");
    }

    #[test]
    fn missing_location_is_rejected() {
        let err = merge_options(CacheOptions::default(), &args(&[])).unwrap_err();
        assert!(err.to_string().contains("--cache-location"));
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let config = load_config("/nonexistent/rendercache.toml");
        assert_eq!(config.cache.database_shards, 8);
        assert!(!config.logging.json);
    }
}
