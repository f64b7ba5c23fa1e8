use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use tapesim_data::demo::{demo_bars, seed_sqlite};
use tapesim_data::validation::{validate_table, ValidationConfig};
use tapesim_data::{CsvSource, DataSource, MemorySource, SqliteSource};
use tapesim_server::{spawn_metrics_server, ReplayServer, ServerConfig, ServerMetrics};

mod settings;
mod telemetry;

use settings::{load_config, AppConfig, DataSourceKind};
use telemetry::init_tracing;

const DEMO_TABLE: &str = "demo_bars";

#[derive(Parser)]
#[command(author, version, about = "tapesim backtest replay server")]
struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the replay server until interrupted
    Serve(ServeArgs),
    /// List the replayable tables the configured datasource advertises
    Tables,
    /// Stream a table end to end and report gaps, spikes and bad rows
    Check(CheckArgs),
    /// Write a deterministic demo bar table into the configured SQLite database
    Seed(SeedArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Listen address override (host:port)
    #[arg(long)]
    listen: Option<String>,
    /// Prometheus endpoint override (host:port)
    #[arg(long)]
    metrics_addr: Option<String>,
    /// Optional JSON log file
    #[arg(long)]
    log_path: Option<std::path::PathBuf>,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long)]
    table: String,
    /// Flag batch spacings above this many seconds
    #[arg(long)]
    max_gap_secs: Option<u64>,
    /// Flag price moves above this fraction (0.05 = 5%)
    #[arg(long, default_value_t = 0.05)]
    jump_threshold: f64,
}

#[derive(Args)]
struct SeedArgs {
    #[arg(long, default_value = DEMO_TABLE)]
    table: String,
    /// Symbols to generate, comma separated
    #[arg(long, value_delimiter = ',', default_value = "AAA,BBB")]
    symbols: Vec<String>,
    /// Bars per symbol
    #[arg(long, default_value_t = 390)]
    rows: usize,
    /// First bar timestamp (RFC3339 or YYYY-MM-DD)
    #[arg(long, default_value = "2021-01-04")]
    start: String,
    /// Bar spacing in seconds
    #[arg(long, default_value_t = 60)]
    step_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level().to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });

    let log_override = match &cli.command {
        Commands::Serve(args) => args.log_path.clone(),
        _ => None,
    };
    init_tracing(&filter, log_override.as_deref()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Serve(args) => serve(args, &config).await,
        Commands::Tables => list_tables(&config).await,
        Commands::Check(args) => check(args, &config).await,
        Commands::Seed(args) => seed(args, &config),
    }
}

/// Build the configured datasource plus the server settings derived from it.
fn build_source(config: &AppConfig) -> Result<(Arc<dyn DataSource>, ServerConfig)> {
    let default_rep = config.datasource.time_rep()?;
    let server_config = ServerConfig {
        default_table: config.default_table.clone(),
        default_rep,
    };
    let source: Arc<dyn DataSource> = match config.datasource.kind {
        DataSourceKind::Sqlite => {
            let mut source = SqliteSource::new(&config.datasource.path, default_rep);
            for (table, time) in &config.tables {
                source = source.with_rep(table, time.time_rep()?);
            }
            Arc::new(source)
        }
        DataSourceKind::Csv => {
            let mut source = CsvSource::new(&config.datasource.path, default_rep);
            for (table, time) in &config.tables {
                source = source.with_rep(table, time.time_rep()?);
            }
            Arc::new(source)
        }
        DataSourceKind::Demo => {
            let start = Utc::now() - Duration::days(1);
            let records = demo_bars(&["AAA", "BBB"], 390, start, Duration::minutes(1));
            Arc::new(
                MemorySource::new()
                    .with_table(DEMO_TABLE, default_rep, records)
                    .map_err(|err| anyhow!("failed to build demo table: {err}"))?,
            )
        }
    };
    Ok((source, server_config))
}

async fn serve(args: ServeArgs, config: &AppConfig) -> Result<()> {
    let (source, server_config) = build_source(config)?;
    let metrics = Arc::new(ServerMetrics::new());

    let metrics_addr = args
        .metrics_addr
        .clone()
        .or_else(|| config.metrics_addr.clone());
    if let Some(addr) = metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid metrics address '{addr}'"))?;
        spawn_metrics_server(metrics.registry(), addr);
        info!(%addr, "metrics endpoint up");
    }

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| config.listen_addr().to_string());
    let mut server = ReplayServer::bind(&listen, source, server_config, metrics)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(addr = %server.local_addr(), "tapesim serving");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}

async fn list_tables(config: &AppConfig) -> Result<()> {
    let (source, _) = build_source(config)?;
    let tables = source.tables().await.context("datasource unavailable")?;
    if tables.is_empty() {
        println!("No replayable tables.");
        return Ok(());
    }
    println!("{:<24} {:<24} {}", "table", "start", "end");
    for table in tables {
        println!(
            "{:<24} {:<24} {}",
            table.name,
            table.start_time.to_rfc3339(),
            table.end_time.to_rfc3339()
        );
    }
    Ok(())
}

async fn check(args: CheckArgs, config: &AppConfig) -> Result<()> {
    const MAX_EXAMPLES: usize = 5;
    let (source, _) = build_source(config)?;
    let validation = ValidationConfig {
        max_gap: args
            .max_gap_secs
            .map(|secs| Duration::seconds(secs as i64)),
        price_jump_threshold: args.jump_threshold.max(f64::EPSILON),
    };
    let summary = validate_table(source.as_ref(), &args.table, validation)
        .await
        .map_err(|err| anyhow!("validation failed: {err}"))?;

    println!(
        "Validation summary for {} ({} batches, {} rows)",
        args.table, summary.batches, summary.rows
    );
    if let (Some(start), Some(end)) = (summary.start, summary.end) {
        println!("  Range: {} -> {}", start.to_rfc3339(), end.to_rfc3339());
    }
    println!("  Zero-volume rows: {}", summary.zero_volume_rows);
    println!("  Non-positive prices: {}", summary.non_positive_prices);
    println!("  Gaps flagged: {}", summary.gaps.len());
    for gap in summary.gaps.iter().take(MAX_EXAMPLES) {
        println!(
            "    {} -> {}",
            gap.start.to_rfc3339(),
            gap.end.to_rfc3339()
        );
    }
    println!("  Price spikes flagged: {}", summary.price_spikes.len());
    for spike in summary.price_spikes.iter().take(MAX_EXAMPLES) {
        println!(
            "    {} {} (change {:.2}%)",
            spike.symbol,
            spike.timestamp.to_rfc3339(),
            spike.change_fraction * 100.0
        );
    }
    if summary.is_clean() {
        println!("Table is clean.");
    }
    Ok(())
}

fn seed(args: SeedArgs, config: &AppConfig) -> Result<()> {
    if config.datasource.kind != DataSourceKind::Sqlite {
        bail!("seed requires datasource.kind = \"sqlite\"");
    }
    let rep = config.datasource.time_rep()?;
    let source = SqliteSource::new(&config.datasource.path, rep);
    let start = parse_datetime(&args.start)?;
    let symbols: Vec<&str> = args.symbols.iter().map(String::as_str).collect();
    let rows = seed_sqlite(
        &source,
        &args.table,
        &symbols,
        args.rows,
        start,
        Duration::seconds(args.step_secs as i64),
    )
    .map_err(|err| anyhow!("seeding failed: {err}"))?;
    info!(
        table = %args.table,
        rows,
        path = %config.datasource.path.display(),
        "seeded demo table"
    );
    Ok(())
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        let dt = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("invalid date"))?;
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(anyhow!("unable to parse datetime '{value}'"))
}
