//! sqlbridge CLI - run SQL against a persisted SQLite image through a worker
//!
//! Usage:
//!   sqlbridge query <sql> [--params <json>] [--insert] [--records]
//!   sqlbridge each <sql> [--params <json>] [--nested]
//!   sqlbridge objects <sql> [--params <json>] [--default <json>]
//!   sqlbridge export <out>
//!   sqlbridge download <dir>
//!
//! Examples:
//!   sqlbridge query "CREATE TABLE Stores(Id INTEGER PRIMARY KEY, Company TEXT)"
//!   sqlbridge query --insert "INSERT INTO Stores(Company) VALUES(\$company)" --params '{"company":"Acme"}'
//!   sqlbridge objects "SELECT P.*, S.Id AS Store_Id FROM Products P LEFT JOIN Stores S ON S.Id = P.StoreId"

use clap::{Parser, Subcommand};
use serde_json::Value;
use sqlbridge::config::{Settings, Transport};
use sqlbridge::database::Database;
use sqlbridge::engine::{self, SqliteEngine};
use sqlbridge::rows::{decode_row, decode_table, RowAccumulator};
use sqlbridge::worker::protocol::Params;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "sqlbridge")]
#[command(about = "sqlbridge - SQL against an embedded SQLite worker, persisted as an image")]
#[command(version)]
struct Cli {
    /// Path to a sqlbridge.toml (overrides the default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute SQL and print the result tables, then persist the image
    Query {
        sql: String,

        /// Parameters as a JSON array (positional) or object (named)
        #[arg(short, long)]
        params: Option<String>,

        /// Enforce foreign keys for this statement
        #[arg(long)]
        insert: bool,

        /// Print decoded records instead of raw tables
        #[arg(long)]
        records: bool,
    },

    /// Stream rows as JSON lines
    Each {
        sql: String,

        #[arg(short, long)]
        params: Option<String>,

        /// Fold `Parent_Child` columns into nested objects
        #[arg(long)]
        nested: bool,
    },

    /// Merge joined rows by id into nested objects
    Objects {
        sql: String,

        #[arg(short, long)]
        params: Option<String>,

        /// JSON object whose fields fill missing or null values
        #[arg(short, long, default_value = "{}")]
        default: String,
    },

    /// Write the database image to a file
    Export {
        out: PathBuf,
    },

    /// Write the database image to <dir>/database.sqlite3
    Download {
        dir: PathBuf,
    },

    /// Serve the worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(s) => serve_self_as_worker(s),
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = sqlbridge::logging::init(&settings.logging) {
        eprintln!("Error initializing logging: {}", e);
        return ExitCode::FAILURE;
    }

    if let Commands::Worker = cli.command {
        return cmd_worker();
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error starting runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli.command, settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Use this binary's `worker` subcommand when no worker binary is found.
fn serve_self_as_worker(mut settings: Settings) -> Settings {
    let worker = &mut settings.worker;
    let unresolved = worker.path.is_none() && worker.worker_path().is_err();
    if worker.transport == Transport::Process && unresolved {
        if let Ok(exe) = std::env::current_exe() {
            worker.path = Some(exe.display().to_string());
        }
    }
    settings
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings, sqlbridge::config::SettingsError> {
    match path {
        Some(path) => Settings::from_file(path),
        None => Settings::load(),
    }
}

fn cmd_worker() -> ExitCode {
    let sqlite = match SqliteEngine::new() {
        Ok(sqlite) => sqlite,
        Err(e) => {
            eprintln!("Error creating engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match engine::serve_stdio(sqlite) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Worker error: {}", e);
            ExitCode::FAILURE
        }
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

async fn run(command: Commands, settings: Settings) -> CliResult {
    let db = Database::from_settings(&settings).await?;
    db.open().await?;

    let result = dispatch(&db, command).await;
    let closed = db.close().await;

    result?;
    closed?;
    Ok(())
}

async fn dispatch(db: &Database, command: Commands) -> CliResult {
    match command {
        Commands::Query {
            sql,
            params,
            insert,
            records,
        } => cmd_query(db, &sql, parse_params(params.as_deref())?, insert, records).await,
        Commands::Each {
            sql,
            params,
            nested,
        } => cmd_each(db, &sql, parse_params(params.as_deref())?, nested).await,
        Commands::Objects {
            sql,
            params,
            default,
        } => cmd_objects(db, &sql, parse_params(params.as_deref())?, &default).await,
        Commands::Export { out } => {
            let image = db.export_database().await?;
            tokio::fs::write(&out, &image).await?;
            println!("Wrote {} bytes to {}", image.len(), out.display());
            Ok(())
        }
        Commands::Download { dir } => {
            let path = db.download_database(&dir).await?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Worker => Ok(()),
    }
}

async fn cmd_query(
    db: &Database,
    sql: &str,
    params: Option<Params>,
    insert: bool,
    records: bool,
) -> CliResult {
    let tables = if insert {
        db.insert(sql, params).await?
    } else {
        db.query(sql, params).await?
    };

    for table in &tables {
        if records {
            println!("{}", serde_json::to_string_pretty(&decode_table(table)?)?);
        } else {
            println!("{}", serde_json::to_string_pretty(table)?);
        }
    }

    db.persist_database().await?;
    Ok(())
}

async fn cmd_each(db: &Database, sql: &str, params: Option<Params>, nested: bool) -> CliResult {
    let count = db
        .each(sql, params, |row| {
            let line = if nested {
                serde_json::to_string(&decode_row(&row)?)?
            } else {
                serde_json::to_string(&row)?
            };
            println!("{}", line);
            Ok(())
        })
        .await?;

    tracing::info!(count, "rows streamed");
    Ok(())
}

async fn cmd_objects(db: &Database, sql: &str, params: Option<Params>, default: &str) -> CliResult {
    let default: Value = serde_json::from_str(default)?;
    let mut accumulator = RowAccumulator::new();

    db.each(sql, params, |row| {
        accumulator.merge(&row)?;
        Ok(())
    })
    .await?;

    let objects: Vec<Value> = accumulator.compile(|| default.clone()).collect();
    println!("{}", serde_json::to_string_pretty(&objects)?);
    Ok(())
}

/// Parse `--params`: a JSON array binds positionally, an object by name.
fn parse_params(raw: Option<&str>) -> Result<Option<Params>, Box<dyn std::error::Error>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    match serde_json::from_str(raw)? {
        Value::Array(values) => Ok(Some(Params::Positional(values))),
        Value::Object(map) => Ok(Some(Params::Named(map))),
        other => Err(format!("--params must be a JSON array or object, got {}", other).into()),
    }
}
