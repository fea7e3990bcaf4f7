//! The Local Guide offline cache CLI
//!
//! Preloads, inspects and queries the offline cache from the command line.
//! Every command prints JSON on stdout; logs go to stderr.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use local_guide::{
    config::{ConfigOverrides, GuideConfig},
    guide_api::{HttpGuideApi, RecommendationQuery, TranslationRequest},
    offline_cache::{quota::DEFAULT_POLL_INTERVAL, types::CleanupOptions},
    OfflineEngine,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Command line interface for the Local Guide offline cache.
#[derive(Debug, Parser)]
#[command(
    name = "local_guide",
    version,
    about = "The Local Guide offline cache: preload, inspect and query cached travel data"
)]
struct Cli {
    /// Explicit cache directory (overrides env + platform default)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Backend base URL (overrides LOCAL_GUIDE_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Session identifier sent as X-Session-ID
    #[arg(long, global = true)]
    session_id: Option<String>,

    /// Treat the network as unavailable and answer from the cache only
    #[arg(long, global = true)]
    offline: bool,

    /// Suppress info logs (only warnings+)
    #[arg(long, global = true)]
    quiet: bool,

    /// Force ANSI color output in logs
    #[arg(long, global = true)]
    color: bool,

    /// Disable ANSI color output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(flatten)]
    Cache(CacheCommand),
    /// Print the resolved cache directory and exit
    PrintCacheDir,
}

/// Subcommands that operate on an opened cache.
#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Preload essential data for offline use
    Preload {
        /// Clear every cache and fetch everything again
        #[arg(long)]
        force: bool,
    },
    /// Print cache statistics and hit/miss counters
    Stats,
    /// Print a storage health report
    Health,
    /// Run a cleanup pass
    Cleanup {
        /// Age threshold in hours for the age phase
        #[arg(long)]
        max_age_hours: Option<u64>,
        /// Size target in bytes for the size phase
        #[arg(long)]
        max_size_bytes: Option<u64>,
        /// Also evict essential entries
        #[arg(long)]
        include_essential: bool,
        /// Remove everything except user preferences
        #[arg(long)]
        emergency: bool,
    },
    /// Delete every cache entry
    Clear,
    /// List recommendations, falling back to cached data when offline
    Recommendations {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        query: Option<String>,
        /// Area the results should be near
        #[arg(long)]
        location: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Translate text, using cached translations when available
    Translate {
        text: String,
        /// Target language code
        #[arg(long)]
        to: String,
        /// Source language code
        #[arg(long)]
        from: Option<String>,
    },
    /// Print what works without a network connection
    Capabilities,
    /// Keep the cache maintained until Ctrl+C
    Run {
        /// Seconds between quota reports
        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
        quota_interval_secs: u64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging / tracing setup
    let mut fmt = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                if cli.quiet {
                    "warn"
                } else {
                    "local_guide=info"
                }
                .parse()?,
            ),
        )
        .with_writer(std::io::stderr)
        .with_target(false);

    // Color handling precedence: --no-color > inherited tty auto > --color
    if cli.no_color {
        fmt = fmt.with_ansi(false);
    } else if cli.color {
        fmt = fmt.with_ansi(true);
    }
    fmt.init();

    let config = GuideConfig::resolve(ConfigOverrides {
        cache_dir: cli.cache_dir.clone(),
        api_url: cli.api_url.clone(),
        session_id: cli.session_id.clone(),
        offline: cli.offline,
    });

    let command = match cli.command {
        Command::PrintCacheDir => {
            println!("{}", config.cache_dir.display());
            return Ok(());
        }
        Command::Cache(command) => command,
    };

    std::fs::create_dir_all(&config.cache_dir).with_context(|| {
        format!(
            "Failed to create cache directory {}",
            config.cache_dir.display()
        )
    })?;
    tracing::debug!(
        "local_guide v{} (cache: {}, api: {})",
        env!("CARGO_PKG_VERSION"),
        config.cache_dir.display(),
        config.api.base_url
    );

    let api = Arc::new(HttpGuideApi::new(&config.api).context("Failed to create API client")?);
    let engine = OfflineEngine::new(&config.cache_dir, api, config.cache.clone())
        .context("Failed to open offline cache")?;
    if config.offline {
        engine.network().set_online(false);
    }

    match command {
        CacheCommand::Preload { force } => {
            let result = if force {
                engine.force_refresh().await
            } else {
                engine.preload_essential(false).await
            };
            print_json(&result)?;
        }
        CacheCommand::Stats => {
            print_json(&serde_json::json!({
                "stats": engine.get_cache_stats(),
                "metrics": engine.metrics(),
                "quota": engine.quota_snapshot(),
            }))?;
        }
        CacheCommand::Health => {
            print_json(&engine.check_storage_health())?;
        }
        CacheCommand::Cleanup {
            max_age_hours,
            max_size_bytes,
            include_essential,
            emergency,
        } => {
            if emergency {
                print_json(&engine.perform_emergency_cleanup())?;
            } else {
                let defaults = engine.default_cleanup_options();
                let options = CleanupOptions {
                    max_age: max_age_hours
                        .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                        .unwrap_or(defaults.max_age),
                    max_size_bytes: max_size_bytes.unwrap_or(defaults.max_size_bytes),
                    preserve_essential: !include_essential,
                };
                print_json(&engine.perform_cleanup(options))?;
            }
        }
        CacheCommand::Clear => {
            print_json(&engine.clear_all_caches())?;
        }
        CacheCommand::Recommendations {
            category,
            query,
            location,
            limit,
        } => {
            let request = RecommendationQuery {
                category,
                query,
                location,
                limit: Some(limit),
                offset: None,
            };
            let response = engine
                .recommendations(&request)
                .await
                .context("No recommendations available")?;
            print_json(&response)?;
        }
        CacheCommand::Translate { text, to, from } => {
            let request = TranslationRequest {
                text,
                source_language: from,
                target_language: to,
                context: None,
            };
            let response = engine
                .translate(&request)
                .await
                .context("Translation unavailable")?;
            print_json(&response)?;
        }
        CacheCommand::Capabilities => {
            print_json(&engine.get_offline_capabilities())?;
        }
        CacheCommand::Run {
            quota_interval_secs,
        } => {
            run_until_interrupted(&engine, &config, quota_interval_secs).await?;
        }
    }

    Ok(())
}

async fn run_until_interrupted(
    engine: &OfflineEngine,
    config: &GuideConfig,
    quota_interval_secs: u64,
) -> Result<()> {
    engine.initialize()?;
    if !config.offline {
        engine.probe_network().await;
    }
    let preload = engine.preload_essential(false).await;
    tracing::info!(
        "Initial preload: success={} errors={}",
        preload.success,
        preload.errors.len()
    );

    let mut quota = engine
        .quota()
        .clone()
        .watch(Duration::from_secs(quota_interval_secs.max(1)))?;

    tracing::info!("Press Ctrl+C to stop…");
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to install Ctrl+C handler")?;
                break;
            }
            changed = quota.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *quota.borrow();
                if snapshot.near_limit {
                    tracing::warn!(
                        "Storage near limit: {} of {} bytes ({:.0}%)",
                        snapshot.used_bytes,
                        snapshot.quota_bytes,
                        snapshot.percentage * 100.0
                    );
                } else {
                    tracing::debug!("Storage usage: {} bytes", snapshot.used_bytes);
                }
            }
        }
    }

    engine.destroy();
    tracing::info!("Stopped");
    Ok(())
}
