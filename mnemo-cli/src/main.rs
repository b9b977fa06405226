//! # MnemoDB CLI
//!
//! Inspects a data directory: replays its WAL and prints tables, rows,
//! checkpoints and segments as JSON.
//!
//! ```bash
//! mnemo --data-dir ./data tables
//! mnemo --data-dir ./data scan models --limit 20 --raw
//! mnemo --data-dir ./data query models --start 20 --limit 20
//! mnemo --config mnemo.toml segments
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use mnemo_core::config::Config;
use mnemo_storage::{DataStore, FsStorage, MergeScanRequest, QueryRequest, TableScan};

/// Inspect MnemoDB data directories
#[derive(Parser, Debug)]
#[command(name = "mnemo", version, about = "Inspect MnemoDB data directories")]
struct Args {
    /// Data directory (overrides the config file)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List tables
    Tables {
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Print a table's schema
    Schema { table: String },
    /// Scan rows in key order
    Scan {
        table: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Print plain values instead of the hex wire form
        #[arg(long)]
        raw: bool,
    },
    /// Page through rows
    Query {
        table: String,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long)]
        raw: bool,
    },
    /// List a table's checkpoints
    Checkpoints { table: String },
    /// Describe stored WAL segments
    Segments,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!(data_dir = %config.storage.data_dir.display(), "Opening data store");
    let storage = Arc::new(FsStorage::open(&config.storage.data_dir)?);
    let store = DataStore::open(config, storage).await?;

    let result = execute(&store, args.command);
    store.terminate().await?;
    let output = result?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn execute(store: &DataStore, command: Command) -> Result<serde_json::Value> {
    debug!(?command, "Executing");
    let output = match command {
        Command::Tables { prefix } => json!(store.list_tables(&prefix)),
        Command::Schema { table } => {
            let schema = store.table_schema(&table)?;
            let columns: Vec<_> = schema
                .columns()
                .map(|c| {
                    json!({
                        "name": c.name,
                        "index": c.index,
                        "type": c.column_type.to_string(),
                    })
                })
                .collect();
            json!({ "key_column": schema.key_column(), "columns": columns })
        }
        Command::Scan { table, limit, raw } => store
            .scan(&MergeScanRequest {
                tables: vec![TableScan::new(table)],
                limit,
                raw_result: raw,
                ..MergeScanRequest::default()
            })?
            .to_json(),
        Command::Query {
            table,
            start,
            limit,
            raw,
        } => store
            .query(
                &table,
                &QueryRequest::new().start(start).limit(limit).raw_result(raw),
            )?
            .to_json(),
        Command::Checkpoints { table } => {
            let checkpoints: Vec<_> = store
                .list_checkpoints(&table)?
                .into_iter()
                .map(|cp| {
                    let time = chrono::DateTime::from_timestamp_millis(cp.timestamp_ms);
                    let mut value = json!(cp);
                    if let Some(time) = time {
                        value["time"] = json!(time.to_rfc3339());
                    }
                    value
                })
                .collect();
            json!(checkpoints)
        }
        Command::Segments => json!(store.segments()?),
        Command::Config => serde_json::to_value(store.config())?,
    };
    Ok(output)
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "mnemo_storage=info,mnemo=info",
        _ => "mnemo_storage=debug,mnemo_core=debug,mnemo=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
