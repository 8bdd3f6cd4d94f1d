//! Sumi-Sluice main entry point
//!
//! This is the command-line interface for the Sumi-Sluice scrape scheduler.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sumi_sluice::config::{load_config_with_hash, Config};
use sumi_sluice::pool::{IdentityPool, ProxyPool};
use sumi_sluice::progress::{
    load_statistics, open_progress, print_statistics, RunStatus, SqliteProgressBackend, Statistics,
};
use sumi_sluice::scheduler::{RunReport, Scheduler, SchedulerSettings};
use sumi_sluice::transport::{
    CredentialSessions, HttpExecutor, HttpProxyProvider, HttpProxyValidator,
};
use sumi_sluice::work::{parse_units, WorkUnit};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Sumi-Sluice: a patient multi-identity scrape scheduler
///
/// Sumi-Sluice runs a backlog of scrape units through a pool of accounts and
/// rotating proxies, backs off when the platform pushes back, and records
/// progress so an interrupted run picks up where it stopped.
#[derive(Parser, Debug)]
#[command(name = "sumi-sluice")]
#[command(version)]
#[command(about = "A patient multi-identity scrape scheduler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Units file, one `<kind> <id> [payload]` per line (stdin when omitted)
    #[arg(long, value_name = "FILE")]
    units: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Discard recorded progress before running
    #[arg(long)]
    fresh: bool,

    /// Validate config and units without sending any request
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,

    /// Print statistics as JSON
    #[arg(long, requires = "stats")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.stats {
        handle_stats(&config, cli.json)
    } else if cli.dry_run {
        let units = read_units(cli.units.as_deref())?;
        handle_dry_run(&config, &units);
        Ok(())
    } else {
        let units = read_units(cli.units.as_deref())?;
        handle_run(config, &config_hash, units, cli.fresh).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_sluice=info,warn"),
            1 => EnvFilter::new("sumi_sluice=debug,info"),
            2 => EnvFilter::new("sumi_sluice=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn read_units(path: Option<&Path>) -> Result<Vec<WorkUnit>> {
    let text = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read units from {}", path.display()))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read units from stdin")?;
            text
        }
    };
    let units = parse_units(&text)?;
    tracing::info!("Loaded {} units", units.len());
    Ok(units)
}

/// Handles the --dry-run mode: shows what would be run
fn handle_dry_run(config: &Config, units: &[WorkUnit]) {
    println!("=== Sumi-Sluice Dry Run ===\n");

    println!("Scheduler:");
    println!("  Concurrency: {}", config.scheduler.concurrency);
    println!("  Max attempts: {}", config.scheduler.max_attempts);
    println!(
        "  Request timeout: {}s",
        config.scheduler.request_timeout_secs
    );
    println!("  Resubmit rounds: {}", config.scheduler.resubmit_rounds);

    println!("\nPacing:");
    println!(
        "  Interval: {}-{}ms (+{}ms jitter)",
        config.pacing.min_interval_ms, config.pacing.max_interval_ms, config.pacing.jitter_ms
    );
    println!(
        "  Long pause every {} requests",
        config.pacing.long_pause_every
    );

    println!("\nIdentities ({}):", config.identity.len());
    for entry in &config.identity {
        println!("  - {}", entry.id);
    }

    println!("\nProxy:");
    if config.proxy.enabled {
        println!(
            "  Provider: {}",
            config.proxy.provider_url.as_deref().unwrap_or("-")
        );
        println!("  Min pool size: {}", config.proxy.min_pool_size);
    } else {
        println!("  Disabled");
    }

    println!("\nOutput:");
    println!("  Database: {}", config.output.database_path);

    println!("\n✓ Configuration is valid");
    println!("✓ Would dispatch {} units", units.len());
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config, json: bool) -> Result<()> {
    let backend = SqliteProgressBackend::new(Path::new(&config.output.database_path))?;
    let statistics = load_statistics(&backend)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&statistics)?);
    } else {
        println!("Database: {}\n", config.output.database_path);
        print_statistics(&statistics);
    }

    Ok(())
}

fn build_proxy_pool(config: &Config) -> Result<ProxyPool> {
    if !config.proxy.enabled {
        return Ok(ProxyPool::disabled());
    }
    let Some(provider) = HttpProxyProvider::from_config(&config.proxy, &config.transport)? else {
        tracing::warn!("Proxy enabled without a provider URL, running without proxies");
        return Ok(ProxyPool::disabled());
    };

    let mut pool = ProxyPool::new(config.proxy.clone(), Arc::new(provider));
    if let Some(validator) = HttpProxyValidator::from_config(&config.proxy, &config.transport) {
        pool = pool.with_validator(Arc::new(validator));
    }
    Ok(pool)
}

/// Handles the main scrape run
async fn handle_run(
    config: Config,
    config_hash: &str,
    units: Vec<WorkUnit>,
    fresh: bool,
) -> Result<()> {
    let store = Arc::new(open_progress(
        Path::new(&config.output.database_path),
        config.scheduler.flush_every,
        config.scheduler.flush_interval(),
    )?);

    if fresh {
        tracing::info!("Starting fresh run (discarding recorded progress)");
        store.reset().await?;
    }

    store.begin_run(config_hash).await?;

    let identities = Arc::new(IdentityPool::from_config(&config));
    let sessions = Arc::new(CredentialSessions);
    let healthy = identities.establish_sessions(sessions.as_ref()).await;
    if healthy == 0 {
        store.finish_run(RunStatus::Failed).await?;
        bail!("no identity has a usable session");
    }
    tracing::info!("{} of {} identities ready", healthy, identities.len().await);

    let scheduler = Scheduler::new(
        SchedulerSettings::from(&config),
        identities,
        Arc::new(build_proxy_pool(&config)?),
        Arc::new(HttpExecutor::from_config(&config)?),
        Arc::clone(&store),
    )
    .with_session_provider(sessions);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight requests");
            on_signal.cancel();
        }
    });

    let concurrency = config.scheduler.concurrency as usize;
    match scheduler
        .run_with_resubmission(units, concurrency, cancel.clone())
        .await
    {
        Ok(report) => {
            let status = if cancel.is_cancelled() {
                RunStatus::Interrupted
            } else {
                RunStatus::Completed
            };
            store.finish_run(status).await?;
            print_report(&report);
        }
        Err(e) => {
            store.finish_run(RunStatus::Failed).await?;
            return Err(e).context("run aborted");
        }
    }

    let statistics = Statistics {
        stats: store.stats().await,
        counts: store.status_counts().await,
        latest_run: store.latest_run().await?,
    };
    println!();
    print_statistics(&statistics);

    Ok(())
}

fn print_report(report: &RunReport) {
    println!("=== Run Report ===\n");
    println!("  Succeeded: {}", report.succeeded());
    println!("  Failed: {}", report.failed());
    println!("  Abandoned: {}", report.abandoned());
    println!("  Skipped (already done): {}", report.skipped());
    if report.interrupted() > 0 {
        println!("  Interrupted: {}", report.interrupted());
    }
}
