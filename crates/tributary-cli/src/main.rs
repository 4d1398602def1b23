//! tributary CLI - connectivity check and load generator
//!
//! `check` resolves a working endpoint from a configuration file and asks it
//! for the server version.
//! `load` pushes synthetic rows through an aggregating queue processor into
//! a table, from several producer threads at once.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tributary::connector::clickhouse::ClickHouseConnector;
use tributary::prelude::*;

#[derive(Parser)]
#[command(name = "tributary")]
#[command(about = "tributary - batched ingestion into column stores with endpoint failover")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and open one connection
    Check {
        /// Configuration file (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Write synthetic rows through the aggregating processor
    Load {
        /// Configuration file (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of producer threads
        #[arg(short, long, default_value = "4")]
        producers: usize,

        /// Rows written by each producer
        #[arg(short, long, default_value = "10000")]
        records: u64,

        /// Target table, with columns (id, ts, producer, value)
        #[arg(short, long, default_value = "tributary_load")]
        table: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => check(&config),
        Commands::Load {
            config,
            producers,
            records,
            table,
        } => load(&config, producers, records, &table),
    }
}

fn load_config(path: &Path) -> anyhow::Result<IngestConfig> {
    IngestConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn check(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("✓ Configuration valid");
    println!("  Endpoints: {}", config.pool.endpoints.join(", "));
    println!(
        "  Database:  {} (user {})",
        config.clickhouse.database, config.clickhouse.user
    );
    println!("  Pool size: {}", config.pool.max_size);
    println!(
        "  Packages:  {} items, {} threads, queue {}, every {}ms",
        config.processor.max_package_size,
        config.processor.processing_thread_count,
        config.processor.processing_queue_max_size,
        config.processor.timer_period_ms
    );

    let pool = FailoverPool::new(config.pool, ClickHouseConnector::new(config.clickhouse)?)?;
    let repository = Repository::new(Arc::new(pool));
    let version = repository
        .query_scalar("SELECT version()", &[])?
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    if let Some(endpoint) = repository.pool().current_endpoint() {
        println!("✓ Connected to {} (server {})", endpoint, version);
    }
    Ok(())
}

fn load(path: &Path, producers: usize, records: u64, table: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let sql = insert_statement(table, ["id", "ts", "producer", "value"])?;

    let connector = ClickHouseConnector::new(config.clickhouse)?;
    let pool = Arc::new(FailoverPool::new(config.pool, connector)?);
    let repository = Arc::new(Repository::new(Arc::clone(&pool)));

    let processor = Arc::new(AggregatingQueueProcessor::new(
        config.processor,
        repository,
        move |repo: &Repository<ClickHouseConnector>,
              package: &Package<Row>,
              _span: &Span|
              -> std::result::Result<(), BoxError> {
            repo.bulk_insert_query(&sql, package)?;
            Ok(())
        },
    )?);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nStopping producers...");
        r.store(false, Ordering::SeqCst);
    })?;

    let failures = processor.failures();
    let reporter = thread::spawn(move || {
        for failure in failures.iter() {
            warn!(
                package_id = failure.package_id,
                items = failure.items,
                error = %failure.error,
                "Package lost"
            );
        }
    });

    processor.start()?;
    let started = Instant::now();
    info!(producers, records, table, "Load started");

    let handles: Vec<_> = (0..producers)
        .map(|producer| {
            let processor = Arc::clone(&processor);
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name(format!("producer-{}", producer))
                .spawn(move || -> tributary::Result<u64> {
                    let mut sent = 0;
                    while sent < records && running.load(Ordering::Relaxed) {
                        processor.add(vec![
                            Value::from(producer as u64 * records + sent),
                            Value::from(chrono::Utc::now()),
                            Value::from(producer as u64),
                            Value::from(sent as f64 * 0.5),
                        ])?;
                        sent += 1;
                    }
                    Ok(sent)
                })
        })
        .collect::<std::io::Result<_>>()?;

    let mut sent = 0;
    for handle in handles {
        match handle.join() {
            Ok(result) => sent += result?,
            Err(_) => anyhow::bail!("producer thread panicked"),
        }
    }

    processor.stop()?;
    let stats = processor.stats();
    let elapsed = started.elapsed();
    processor.dispose();
    drop(processor);
    let _ = reporter.join();

    println!("✓ Load finished in {:.2}s", elapsed.as_secs_f64());
    println!("  Sent:      {}", sent);
    println!("  Added:     {}", stats.total_added_items);
    println!(
        "  Pushed:    {} ({} packages)",
        stats.total_pushed_items, stats.total_pushed_packages
    );
    println!("  Processed: {}", stats.total_processed_items);
    println!(
        "  Failed:    {} ({} packages)",
        stats.total_failed_items, stats.total_failed_packages
    );
    if let Some(endpoint) = pool.current_endpoint() {
        println!("  Endpoint:  {}", endpoint);
    }
    let pool_stats = pool.stats();
    println!(
        "  Pool:      {} rentals, {:.1}ms avg wait, {} failovers",
        pool_stats.acquisitions,
        pool_stats.avg_wait_time_ms(),
        pool_stats.failovers
    );
    println!(
        "  Rate:      {:.0} rows/s",
        stats.total_processed_items as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    Ok(())
}
