//! oxide-dbgen CLI
//!
//! Command-line tool for updating a database schema from a concept model.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use oxide_dbgen::prelude::*;

/// Incremental database schema generator.
#[derive(Parser)]
#[command(name = "oxide-dbgen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Name of the database lock held during an update.
    #[arg(long, env = "DBGEN_LOCK_NAME", default_value = "oxide_dbgen")]
    lock_name: String,

    /// Maximum number of scripts joined into one round-trip.
    #[arg(long, env = "DBGEN_MAX_JOINED_SCRIPT_COUNT", default_value_t = 100)]
    max_joined_script_count: usize,

    /// Maximum size in bytes of a joined script.
    #[arg(long, env = "DBGEN_MAX_JOINED_SCRIPT_SIZE", default_value_t = 1_000_000)]
    max_joined_script_size: usize,

    /// Seconds between progress reports.
    #[arg(long, env = "DBGEN_PROGRESS_INTERVAL", default_value_t = 10)]
    progress_interval: u64,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the metadata tables.
    Init,

    /// Update the database structure to match a model file.
    Generate {
        /// Model file (JSON).
        #[arg(short, long, env = "DBGEN_MODEL")]
        model: PathBuf,

        /// Print the scripts without executing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the applied concept applications.
    Show,
}

impl Cli {
    fn options(&self) -> GeneratorOptions {
        GeneratorOptions {
            dry_run: false,
            lock_name: self.lock_name.clone(),
            batches: BatchOptions {
                max_joined_script_count: self.max_joined_script_count,
                max_joined_script_size: self.max_joined_script_size,
                progress_interval_secs: self.progress_interval,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Connect to database
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&cli.database)
        .await?;

    let dialect: Arc<dyn SqlDialect> = Arc::new(SqliteDialect::new());
    let repository = SqliteConceptApplicationRepository::new(pool.clone(), Arc::clone(&dialect));
    let generator = DatabaseGenerator::new(SqliteExecutor::new(pool), repository, dialect)
        .options(cli.options());

    match cli.command {
        Commands::Init => {
            info!("Initializing metadata tables...");
            generator.repository().ensure_tables().await?;
            info!("Metadata tables created successfully.");
        }

        Commands::Generate { model, dry_run } => {
            let (concepts, plugins) = ModelFile::load(&model)?.into_model()?;
            info!(
                model = %model.display(),
                concepts = concepts.len(),
                plugins = plugins.len(),
                "Loaded concept model"
            );

            if dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                let plan = generator.plan(&concepts, &plugins).await?;
                for script in &plan.scripts {
                    println!("{};", script.sql.trim_end().trim_end_matches(';'));
                }
                let report = plan.report(0);
                info!(
                    removed = report.removed,
                    inserted = report.inserted,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    "Dry run complete"
                );
            } else {
                let report = generator
                    .update_database_structure(&concepts, &plugins)
                    .await?;
                println!(
                    "Removed {}, inserted {}, updated {}, unchanged {} ({} scripts executed)",
                    report.removed,
                    report.inserted,
                    report.updated,
                    report.unchanged,
                    report.executed_scripts
                );
            }
        }

        Commands::Show => {
            let applied = generator.repository().load().await?;

            if applied.is_empty() {
                info!("No concept applications have been applied yet.");
            } else {
                println!("\nApplied concept applications:");
                println!("{:-<60}", "");

                for application in &applied {
                    let applied_at = application
                        .applied_at
                        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        " [X] {} ({} dependencies, {})",
                        application.key(),
                        application.depends_on.len(),
                        applied_at
                    );
                }
                println!();
            }
        }
    }

    Ok(())
}
