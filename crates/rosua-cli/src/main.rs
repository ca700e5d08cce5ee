mod output;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rosua_config::{AppConfig, ConfigLoader};
use rosua_migrations::{Generator, MigrationRegistry, Migrator, RecordingMode};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rosua", version, about = "Versioned migrations for SQLite databases")]
struct Cli {
    /// Config file (YAML or TOML). Defaults to rosua.yml / rosua.toml in the
    /// current directory when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database to migrate; overrides `database` from the config file.
    #[arg(short, long, global = true, env = "ROSUA_DATABASE")]
    database: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the ledger table if it does not exist yet
    Install,
    /// Show every discovered migration and whether it has been applied
    List {
        #[arg(long)]
        json: bool,
    },
    /// Apply all pending migrations in version order
    #[command(alias = "migrate")]
    Execute {
        /// Record results only after every pending migration succeeded
        #[arg(long)]
        legacy_batch: bool,
        #[arg(long)]
        json: bool,
    },
    /// Scaffold a new <version>.up.sql / <version>.down.sql pair
    Generate {
        /// SQL for the up script
        up: Option<String>,
        /// SQL for the down script
        down: Option<String>,
        /// Readable suffix for the version identifier
        #[arg(short, long)]
        name: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let config = ConfigLoader::load_or_default(cli.config.as_deref(), &cwd)
        .context("failed to load configuration")?;
    debug!("migrations directory: {}", config.migrations.migrations_path().display());

    match cli.command {
        Commands::Install => {
            let migrator = open_migrator(&config, cli.database.as_deref(), RecordingMode::default())?;
            let table = migrator.config().ledger_table();
            if migrator.install()? {
                println!("Created ledger table {table}.");
            } else {
                println!("Ledger table {table} is already installed.");
            }
        }
        Commands::List { json } => {
            let migrator = open_migrator(&config, cli.database.as_deref(), RecordingMode::default())?;
            let listing = migrator.listing()?;
            if json {
                output::print_json(&listing.entries)?;
            } else {
                output::print_status(&listing.entries);
            }
            output::print_rejected(&listing.rejected);
        }
        Commands::Execute { legacy_batch, json } => {
            let mode = if legacy_batch {
                RecordingMode::Batch
            } else {
                RecordingMode::PerMigration
            };
            let migrator = open_migrator(&config, cli.database.as_deref(), mode)?;
            // Same as the activation hook: the ledger must exist before executing.
            migrator.install()?;
            let executed = migrator.execute().context("migration run aborted")?;
            if json {
                output::print_json(&executed)?;
            } else {
                output::print_executed(&executed);
            }
        }
        Commands::Generate { up, down, name } => {
            let generated = Generator::new(&config.migrations).generate(
                name.as_deref(),
                up.as_deref(),
                down.as_deref(),
            )?;
            println!("{}", generated.up_path.display());
            println!("{}", generated.down_path.display());
        }
    }

    Ok(())
}

fn open_migrator(
    config: &AppConfig,
    database: Option<&Path>,
    mode: RecordingMode,
) -> Result<Migrator> {
    let db_path = database
        .or(config.database.as_deref())
        .context("no database given; pass --database or set `database` in the config file")?;

    let migrator = Migrator::open(config.migrations.clone(), db_path, MigrationRegistry::new())
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    Ok(migrator.with_recording_mode(mode))
}
