//! shapesync CLI - replicate shapes into a local database
//!
//! Usage:
//!   shapesync sync --identity <id> --table <table> [--where <filter>] [--columns a,b] [--follow]
//!   shapesync list
//!   shapesync purge
//!
//! Examples:
//!   shapesync sync --identity user_42 --table documents --where "search_space_id = 3"
//!   SHAPESYNC_URL=https://sync.example.com shapesync sync --identity u1 --table notifications --follow

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shapesync::config::Settings;
use shapesync::db::{DatabaseNaming, FileStorage, StorageBackend};
use shapesync::shape::{ReadinessPhase, ShapeDescriptor};
use shapesync::{SyncClient, SyncError};

#[derive(Parser)]
#[command(name = "shapesync")]
#[command(about = "shapesync - Keep a local SQLite replica of remote table shapes")]
#[command(version)]
struct Cli {
    /// Config file (defaults to SHAPESYNC_CONFIG, ./shapesync.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync one shape and report the local row count
    Sync {
        /// Identity the replica belongs to
        #[arg(short, long)]
        identity: String,

        /// Table to replicate
        #[arg(short, long)]
        table: String,

        /// Row filter, e.g. "search_space_id = 3"
        #[arg(short, long = "where")]
        filter: Option<String>,

        /// Comma-separated projection (must include the primary key)
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Keep replicating until Ctrl-C
        #[arg(long)]
        follow: bool,
    },

    /// List stored replica databases
    List,

    /// Delete every stored replica database
    Purge,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shapesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Sync {
            identity,
            table,
            filter,
            columns,
            follow,
        } => cmd_sync(settings, identity, table, filter, columns, follow),
        Commands::List => cmd_list(&settings),
        Commands::Purge => cmd_purge(&settings),
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, SyncError> {
    Ok(match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::load()?,
    })
}

fn cmd_sync(
    settings: Settings,
    identity: String,
    table: String,
    filter: Option<String>,
    columns: Option<Vec<String>>,
    follow: bool,
) -> ExitCode {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let client = SyncClient::from_settings(&settings)?;
        let outcome = sync_once(&client, &identity, &table, filter, columns, follow).await;
        if follow || outcome.is_err() {
            client.release().await;
        }
        outcome
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn sync_once(
    client: &SyncClient,
    identity: &str,
    table: &str,
    filter: Option<String>,
    columns: Option<Vec<String>>,
    follow: bool,
) -> Result<(), SyncError> {
    client.initialize(identity).await?;

    let mut descriptor = ShapeDescriptor::new(table);
    if let Some(filter) = filter {
        descriptor = descriptor.filter(filter);
    }
    if let Some(columns) = columns {
        descriptor = descriptor.columns(columns);
    }

    let shape = client.sync_shape(descriptor).await?;
    let phase = shape.initial_sync().await?;
    let rows = client.database().await?.row_count(table)?;

    match phase {
        ReadinessPhase::CaughtUp => println!("{table}: {rows} rows (up to date)"),
        ReadinessPhase::TimedOut => println!("{table}: {rows} rows (still catching up)"),
        ReadinessPhase::Contended => println!("{table}: {rows} rows (shape busy elsewhere)"),
        other => println!("{table}: {rows} rows ({other:?})"),
    }

    if follow {
        println!("Following {table}, press Ctrl-C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Warning: failed to listen for Ctrl-C: {e}");
        }
        let rows = client.database().await?.row_count(table)?;
        println!("{table}: {rows} rows");
    }
    Ok(())
}

fn storage_for(settings: &Settings) -> Result<(FileStorage, DatabaseNaming), SyncError> {
    let storage = FileStorage::new(settings.storage.resolved_directory()?);
    let naming = DatabaseNaming::new(
        settings.storage.prefix.clone(),
        settings.storage.schema_version,
    );
    Ok((storage, naming))
}

fn cmd_list(settings: &Settings) -> ExitCode {
    let result = storage_for(settings).and_then(|(storage, naming)| {
        let names = storage.list()?;
        Ok((storage, naming, names))
    });

    match result {
        Ok((storage, naming, names)) => {
            let owned: Vec<&String> = names.iter().filter(|n| naming.owns(n)).collect();
            if owned.is_empty() {
                println!("No databases in {}", storage.dir().display());
            } else {
                println!("Databases in {}:", storage.dir().display());
                for name in owned {
                    println!("  {name}");
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_purge(settings: &Settings) -> ExitCode {
    let result = storage_for(settings).and_then(|(storage, naming)| {
        let mut deleted = 0;
        for name in storage.list()?.iter().filter(|n| naming.owns(n)) {
            storage.delete(name)?;
            deleted += 1;
        }
        Ok(deleted)
    });

    match result {
        Ok(deleted) => {
            println!("Deleted {deleted} database(s)");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
