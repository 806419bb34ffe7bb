//! pg-schema-sync CLI - PostgreSQL schema sync and data migration.

use clap::{Args, Parser, Subcommand};
use pg_schema_sync::{
    Config, DataResult, FkMode, JsonReport, MigrateError, Orchestrator, SyncOptions, SyncResult,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "pg-schema-sync")]
#[command(about = "PostgreSQL schema sync and data migration")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Target name from the config (required when several are defined)
    #[arg(long)]
    target: Option<String>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(flatten)]
    sync: SyncArgs,

    /// Without a subcommand the schema sync runs
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Schema sync flags.
#[derive(Args, Debug, Clone)]
struct SyncArgs {
    /// Report object differences only; no SQL is generated
    #[arg(long)]
    verify: bool,

    /// Apply the generated migration to the target (default)
    #[arg(long, overrides_with = "no_commit")]
    commit: bool,

    /// Only write the migration files
    #[arg(long, overrides_with = "commit")]
    no_commit: bool,

    /// Alter columns in place where safe instead of recreating tables
    #[arg(long)]
    use_alter: bool,

    /// Run the data migration after applying the schema
    #[arg(long)]
    with_data: bool,

    /// Do not generate foreign key statements
    #[arg(long, conflicts_with = "fk_not_valid")]
    skip_fk: bool,

    /// Add foreign keys as NOT VALID and write a validate file
    #[arg(long)]
    fk_not_valid: bool,

    /// CREATE EXTENSION for allow-listed extensions missing on the target
    #[arg(long)]
    install_extensions: bool,
}

impl SyncArgs {
    fn options(&self) -> SyncOptions {
        let fk_mode = if self.skip_fk {
            FkMode::Skip
        } else if self.fk_not_valid {
            FkMode::NotValid
        } else {
            FkMode::Add
        };
        SyncOptions {
            verify_only: self.verify,
            commit: !self.no_commit,
            use_alter: self.use_alter,
            with_data: self.with_data,
            fk_mode,
            install_extensions: self.install_extensions,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Load all table data into the existing target schema
    MigrateData,

    /// Load a single table, leaving constraints in place
    MigrateTable {
        /// Table name in the configured schema
        table: String,
    },

    /// Run deferred VALIDATE CONSTRAINT statements
    ValidateFks {
        /// Validate file [default: newest in the history directory]
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List target constraints that are still NOT VALID
    CheckSchema,

    /// Compare row counts between source and target
    CheckData,

    /// Test database connections
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

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);
    let target = cli.target.as_deref();

    match cli.command {
        None => {
            let orchestrator = Orchestrator::new(config, target).await?;
            let result = orchestrator.sync(&cli.sync.options()).await?;
            print_result(&result, cli.output_json, print_sync)?;
            result.ensure_complete()?;
        }

        Some(Commands::MigrateData) => {
            let orchestrator = Orchestrator::new(config, target).await?;
            let result = orchestrator.migrate_data().await?;
            print_result(&result, cli.output_json, print_data)?;
            result.ensure_complete()?;
        }

        Some(Commands::MigrateTable { table }) => {
            let orchestrator = Orchestrator::new(config, target).await?;
            let result = orchestrator.migrate_table(&table).await?;
            print_result(&result, cli.output_json, print_data)?;
            result.ensure_complete()?;
        }

        Some(Commands::ValidateFks { file }) => {
            let orchestrator = Orchestrator::new(config, target).await?;
            let result = orchestrator.validate_fks(file).await?;
            print_result(&result, cli.output_json, |r| match &r.file {
                Some(f) => println!(
                    "Validated {} constraints from {}",
                    r.statements_executed,
                    f.display()
                ),
                None => println!("No validate file found"),
            })?;
        }

        Some(Commands::CheckSchema) => {
            let orchestrator = Orchestrator::new(config, target).await?;
            let result = orchestrator.check_schema().await?;
            print_result(&result, cli.output_json, |r| {
                if r.unvalidated.is_empty() {
                    println!("All constraints on {} are validated", r.target);
                    return;
                }
                println!("NOT VALID constraints on {}:", r.target);
                for c in &r.unvalidated {
                    println!("  {} {} on {}", c.constraint_type, c.constraint, c.table);
                }
            })?;
        }

        Some(Commands::CheckData) => {
            let orchestrator = Orchestrator::new(config, target).await?;
            let result = orchestrator.check_data().await?;
            print_result(&result, cli.output_json, |r| {
                println!("Row counts: {} tables checked", r.check.tables_checked);
                for m in &r.check.mismatches {
                    println!("  MISMATCH {}: source={} target={}", m.table, m.source, m.target);
                }
            })?;
            if !result.check.is_clean() {
                return Err(MigrateError::Validation(format!(
                    "{} table(s) have mismatched row counts",
                    result.check.mismatches.len()
                )));
            }
        }

        Some(Commands::HealthCheck) => {
            let result = Orchestrator::health_check(&config, target).await?;
            print_result(&result, cli.output_json, |r| {
                println!("Health Check Results:");
                for (role, ep) in [("Source", &r.source), ("Target", &r.target)] {
                    match ep.latency_ms {
                        Some(ms) => println!("  {} ({}): OK ({}ms)", role, ep.endpoint, ms),
                        None => println!("  {} ({}): FAILED", role, ep.endpoint),
                    }
                    if let Some(ref err) = ep.error {
                        println!("    Error: {}", err);
                    }
                }
                println!(
                    "\n  Overall: {}",
                    if r.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            })?;
            if !result.healthy {
                return Err(MigrateError::Validation("Health check failed".to_string()));
            }
        }
    }

    Ok(())
}

fn print_result<T: JsonReport>(result: &T, json: bool, text: impl Fn(&T)) -> Result<(), MigrateError> {
    if json {
        println!("{}", result.to_json()?);
    } else {
        text(result);
    }
    Ok(())
}

fn print_sync(r: &SyncResult) {
    if let Some(report) = &r.verify {
        println!("Verification of target {}:", r.target);
        for c in &report.categories {
            let mark = if c.synced { "in sync" } else { "DIFFERS" };
            println!(
                "  {:<12} source={:<4} target={:<4} {}",
                c.category, c.source_count, c.target_count, mark
            );
            if !c.source_only.is_empty() {
                println!("    missing on target: {}", c.source_only.join(", "));
            }
            if !c.target_only.is_empty() {
                println!("    only on target: {}", c.target_only.join(", "));
            }
        }
        if !report.target_only_pkeys.is_empty() {
            println!("  target-only primary key indexes: {}", report.target_only_pkeys.join(", "));
        }
        return;
    }

    println!("\nSchema sync {} ({})", r.status, r.target);
    println!("  Duration: {:.2}s", r.duration_seconds);
    println!("  Blocks: {}/{} applied", r.blocks_applied, r.blocks_total);
    for (category, n) in &r.summary {
        println!("    {}: {}", category, n);
    }
    println!("  Up to date: {}", r.skipped_objects);
    if !r.recreated_tables.is_empty() {
        println!("  Recreated tables: {}", r.recreated_tables.join(", "));
    }
    for w in &r.warnings {
        println!("  Warning: {}", w);
    }
    for (label, path) in [
        ("Migration", &r.migration_file),
        ("Skip log", &r.skip_file),
        ("Validate", &r.validate_file),
    ] {
        if let Some(p) = path {
            println!("  {} file: {}", label, p.display());
        }
    }
    if let Some(data) = &r.data {
        print_data_report(data);
    }
}

fn print_data(r: &DataResult) {
    println!("\nData migration {} ({})", r.status, r.target);
    print_data_report(&r.report);
    if let Some(p) = &r.validate_file {
        println!("  Validate file: {}", p.display());
    }
}

fn print_data_report(report: &pg_schema_sync::DataMigrationReport) {
    let rows: u64 = report.tables_loaded.values().sum();
    println!("  Duration: {:.2}s", report.duration_seconds);
    println!(
        "  Tables: {} loaded ({} rows) in {} round(s)",
        report.tables_loaded.len(),
        rows,
        report.load_rounds
    );
    if !report.skipped_tables.is_empty() {
        println!("  Skipped: {}", report.skipped_tables.join(", "));
    }
    if !report.missing_on_target.is_empty() {
        println!("  Missing on target: {}", report.missing_on_target.join(", "));
    }
    for (table, error) in &report.failed_tables {
        println!("  FAILED {}: {}", table, error);
    }
    println!(
        "  Foreign keys: {} dropped, {} restored NOT VALID, {} failed",
        report.constraints_dropped,
        report.constraints_restored,
        report.constraint_failures.len()
    );
    println!("  Sequences adjusted: {}", report.sequences.adjustments.len());
    for m in &report.row_counts.mismatches {
        println!("  Row count MISMATCH {}: source={} target={}", m.table, m.source, m.target);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity: {}", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format: {}", other)),
    }

    Ok(())
}
