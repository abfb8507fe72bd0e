//! Creation Kernel CLI
//!
//! Offline tooling around the kernel's wire formats: hash a state, inspect a payload,
//! browse a sled state cache, and print the effective configuration.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use creation_kernel::cache::SledCache;
use creation_kernel::codec::{state_hash, Json};
use creation_kernel::config::KernelConfig;
use creation_kernel::interfaces::Transaction;
use creation_kernel::logging::{init_logging, LoggingConfig};
use creation_kernel::payload::Payload;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ckernel", version, about = "Creation kernel tooling")]
struct Cli {
    /// Workspace root holding ckernel.toml and ckernel.trust
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Enable logging
    #[arg(long, short)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the state hash of an encoded state
    Hash {
        /// JSON file holding the state
        file: PathBuf,
    },
    /// Summarize a payload, or the payload of a transaction
    Payload {
        /// JSON file holding a payload or a transaction
        file: PathBuf,
    },
    /// Inspect a sled state cache
    Cache {
        /// Cache directory; defaults to cache.path from the configuration
        #[arg(long)]
        path: Option<PathBuf>,

        #[command(subcommand)]
        action: CacheAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Print one entry
    Get { key: String },
    /// List keys, optionally under a prefix
    List { prefix: Option<String> },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(Some(&build_logging_config(&cli))) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }
    info!(command = ?cli.command, "ckernel starting");

    match run(&cli) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = KernelConfig::load(&cli.workspace)
        .map(|c| c.logging)
        .unwrap_or_default();
    if !cli.verbose {
        config.level = "off".to_string();
        return config;
    }
    if let Some(level) = &cli.log_level {
        config.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.format = format.clone();
    }
    config
}

fn run(cli: &Cli) -> Result<String> {
    match &cli.command {
        Command::Hash { file } => {
            let state = read_json(file)?;
            Ok(state_hash(&state)?)
        }
        Command::Payload { file } => {
            let json = read_json(file)?;
            let payload = if json.get("outputs").is_some() {
                let tx: Transaction = serde_json::from_value(json)?;
                Payload::from_transaction(&tx)?
            } else {
                Payload::parse(&json.to_string())?
            };
            Ok(format_payload(&payload))
        }
        Command::Cache { path, action } => {
            let path = match path {
                Some(path) => path.clone(),
                None => KernelConfig::load(&cli.workspace)?
                    .cache
                    .path
                    .ok_or_else(|| anyhow!("No cache path given and cache.path is not configured"))?,
            };
            let cache = SledCache::new(&path)
                .with_context(|| format!("Failed to open cache at {}", path.display()))?;
            match action {
                CacheAction::Get { key } => match cache.read(key)? {
                    Some(value) => Ok(serde_json::to_string_pretty(&value)?),
                    None => Err(anyhow!("No entry for {}", key)),
                },
                CacheAction::List { prefix } => {
                    let keys = cache.list_keys(prefix.as_deref())?;
                    Ok(keys.join("\n"))
                }
            }
        }
        Command::Config => {
            let config = KernelConfig::load(&cli.workspace)?;
            Ok(serde_json::to_string_pretty(&config)?)
        }
    }
}

fn read_json(path: &Path) -> Result<Json> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not JSON", path.display()))
}

fn format_payload(payload: &Payload) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Op", "Data"]);
    for (i, cmd) in payload.cmds.iter().enumerate() {
        let data = cmd.data.to_string();
        let data = if data.chars().count() > 60 {
            format!("{}...", data.chars().take(57).collect::<String>())
        } else {
            data
        };
        table.add_row(vec![
            Cell::new(i),
            Cell::new(format!("{:?}", cmd.op).to_uppercase()),
            Cell::new(data),
        ]);
    }
    format!(
        "inputs: {}  refs: {}  outputs: {}  deletes: {}  new locks: {}\n{}",
        payload.inputs,
        payload.refs.len(),
        payload.out.len(),
        payload.del.len(),
        payload.lock.len(),
        table
    )
}
