//! Strata CLI - Admin Command Line Interface
//!
//! Opens the store described by a TOML configuration and runs one
//! operation against it.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value, json};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use strata_common::{FieldGroup, Key, KeyGroup, StoreConfig, system_clock};
use strata_storage::{Store, open_store};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "strata-cli")]
#[command(about = "Strata field-group store CLI")]
#[command(version)]
struct Args {
    /// Store configuration file (TOML); an in-memory store when absent
    #[arg(short, long, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a record, or selected fields of it
    Get {
        key: String,
        /// Fields to read (all fields when omitted)
        #[arg(short, long)]
        field: Vec<String>,
    },
    /// Merge fields into a record
    Set {
        key: String,
        /// Fields as field=value
        #[arg(required = true)]
        pairs: Vec<String>,
        /// Expiry in unix seconds (0 never, negative keeps the current one)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        expiry: i64,
    },
    /// Delete a record, or selected fields of it
    Del {
        key: String,
        /// Fields to delete (the whole record when omitted)
        #[arg(short, long)]
        field: Vec<String>,
    },
    /// Write a backup stream to a file
    Backup {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Marker from a previous backup (0 for a full backup)
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
    /// Load a backup stream from a file
    Restore {
        /// Input file
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Snapshot the store and truncate its log
    Flush,
    /// Print engine statistics
    Stats,
}

fn parse_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((field, value)) if !field.is_empty() => Ok((field.to_string(), value.to_string())),
            _ => bail!("expected field=value, got {pair:?}"),
        })
        .collect()
}

fn selector(key: String, fields: Vec<String>) -> KeyGroup {
    if fields.is_empty() {
        KeyGroup::all(key.into_bytes())
    } else {
        KeyGroup::fields(key.into_bytes(), fields)
    }
}

fn render(fg: &FieldGroup) -> Value {
    let fields: Map<String, Value> = fg
        .iter()
        .map(|(f, v)| {
            (
                String::from_utf8_lossy(f).into_owned(),
                Value::String(String::from_utf8_lossy(v).into_owned()),
            )
        })
        .collect();
    json!({ "fields": fields, "expiry": fg.expiry })
}

fn run(store: &dyn Store, command: Commands) -> Result<()> {
    match command {
        Commands::Get { key, field } => {
            let got = store.get_many(&[selector(key, field)])?;
            match got.first() {
                Some(fg) if !fg.is_empty() => println!("{}", serde_json::to_string_pretty(&render(fg))?),
                _ => println!("(not found)"),
            }
        }
        Commands::Set { key, pairs, expiry } => {
            let delta = FieldGroup::from_pairs(parse_pairs(&pairs)?, expiry);
            store.set_many(&[Key::from(key.into_bytes())], &[delta])?;
            println!("OK");
        }
        Commands::Del { key, field } => {
            store.del_many(&[selector(key, field)])?;
            println!("OK");
        }
        Commands::Backup { output, since } => {
            let file = File::create(&output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let mut sink = BufWriter::new(file);
            let marker = store.backup(&mut sink, since)?;
            sink.flush()?;
            info!("Backup written to {}", output.display());
            println!("marker: {marker}");
        }
        Commands::Restore { input } => {
            let file = File::open(&input)
                .with_context(|| format!("failed to open {}", input.display()))?;
            store.restore(&mut BufReader::new(file))?;
            println!("OK");
        }
        Commands::Flush => {
            store.flush()?;
            println!("OK");
        }
        Commands::Stats => {
            let stats = store.stats();
            let metrics: Map<String, Value> = stats
                .metrics
                .iter()
                .map(|(name, value)| (name.clone(), json!(value)))
                .collect();
            let out = json!({ "store": store.name(), "engine": stats.engine, "metrics": metrics });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig {
            stats_interval_ms: 0,
            ..StoreConfig::default()
        },
    };
    let store = open_store(&config, system_clock())?;
    let result = run(store.as_ref(), args.command);
    store.close()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs(&["city=SF".to_string(), "note=a=b".to_string()]).unwrap();
        assert_eq!(pairs[0], ("city".to_string(), "SF".to_string()));
        assert_eq!(pairs[1], ("note".to_string(), "a=b".to_string()));
        assert!(parse_pairs(&["novalue".to_string()]).is_err());
        assert!(parse_pairs(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "strata-cli", "set", "u123", "city=SF", "--expiry", "-1",
        ])
        .unwrap();
        assert!(matches!(args.command, Commands::Set { expiry: -1, .. }));
    }

    #[test]
    fn test_run_against_memory_store() {
        let config = StoreConfig {
            stats_interval_ms: 0,
            ..StoreConfig::default()
        };
        let store = open_store(&config, system_clock()).unwrap();
        run(
            store.as_ref(),
            Commands::Set {
                key: "u123".into(),
                pairs: vec!["city=SF".into()],
                expiry: 0,
            },
        )
        .unwrap();
        let got = store.get_many(&[selector("u123".into(), vec![])]).unwrap();
        assert_eq!(render(&got[0])["fields"]["city"], "SF");
    }
}
