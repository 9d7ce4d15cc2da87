//! history-migrate CLI - incremental workflow history migration.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use history_migrate::{
    Config, EntityFilter, EntityType, MigrateError, Orchestrator, RunMode, RunReport,
};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "history-migrate")]
#[command(about = "Incremental migration of workflow execution history")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Cutover timestamp (RFC 3339) used to close open instances [default: now]
    #[arg(long)]
    cutover: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TypeFilter {
    /// Restrict to an entity type (repeatable)
    #[arg(long = "entity-type", value_name = "TYPE")]
    entity_types: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate legacy records that were never migrated or skipped
    Migrate(TypeFilter),

    /// Re-attempt records in the skip ledger
    RetrySkipped(TypeFilter),

    /// List legacy id to target key mappings
    ListMappings(TypeFilter),

    /// List skipped records and their reasons
    ListSkipped(TypeFilter),

    /// Test source and state connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    let (mode, filter) = match &cli.command {
        Commands::Migrate(f) => (RunMode::Migrate, f),
        Commands::RetrySkipped(f) => (RunMode::RetrySkipped, f),
        Commands::ListMappings(f) => (RunMode::ListMappings, f),
        Commands::ListSkipped(f) => (RunMode::ListSkipped, f),
        Commands::HealthCheck => return health_check(&config, cli.output_json).await,
    };
    let filter = entity_filter(&filter.entity_types, &config)?;

    let mut orchestrator = Orchestrator::from_config(&config).await?;
    if let Some(ref cutover) = cli.cutover {
        orchestrator = orchestrator.with_cutover(parse_cutover(cutover)?);
    }

    let report = orchestrator.run(mode, &filter).await?;

    if cli.output_json {
        println!("{}", report.to_json()?);
    } else {
        print_report(&report);
    }

    Ok(())
}

/// Command-line types win over `migration.entity_types`.
fn entity_filter(args: &[String], config: &Config) -> Result<EntityFilter, MigrateError> {
    if args.is_empty() {
        return Ok(EntityFilter::only(config.entity_types()?));
    }
    let types = args
        .iter()
        .map(|s| s.parse::<EntityType>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EntityFilter::only(types))
}

fn parse_cutover(value: &str) -> Result<DateTime<Utc>, MigrateError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| MigrateError::Config(format!("Invalid --cutover '{}': {}", value, e)))
}

fn print_report(report: &RunReport) {
    if let Some(ref listing) = report.listing {
        print!("{}", listing);
        return;
    }

    let title = match report.mode {
        RunMode::RetrySkipped => "Retry completed!",
        _ => "Migration completed!",
    };
    println!("\n{}", title);
    println!("  Run ID: {}", report.run_id);
    println!("  Cutover: {}", report.cutover.to_rfc3339());
    println!("  Duration: {:.2}s", report.duration_seconds);
    for entity in &report.entities {
        println!(
            "  {}: {} migrated, {} skipped ({} in legacy store)",
            entity.entity_type, entity.migrated, entity.skipped, entity.legacy_total
        );
    }
    println!(
        "  Total: {} migrated, {} skipped",
        report.total_migrated(),
        report.total_skipped()
    );
}

async fn health_check(config: &Config, output_json: bool) -> Result<(), MigrateError> {
    let orchestrator = Orchestrator::from_config(config).await?;
    let result = orchestrator.health_check().await?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Health Check Results:");
        println!(
            "  Source ({}): {} ({}ms)",
            result.source_type,
            if result.source_connected { "OK" } else { "FAILED" },
            result.source_latency_ms
        );
        if let Some(ref err) = result.source_error {
            println!("    Error: {}", err);
        }
        println!(
            "  State ({}): {} ({}ms)",
            result.state_type,
            if result.state_connected { "OK" } else { "FAILED" },
            result.state_latency_ms
        );
        if let Some(ref err) = result.state_error {
            println!("    Error: {}", err);
        }
        println!(
            "\n  Overall: {}",
            if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
        );
    }

    if !result.healthy {
        return Err(MigrateError::Config("Health check failed".to_string()));
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so listings and JSON output stay clean on stdout.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("Unknown log format: {}", other)),
    }

    Ok(())
}
