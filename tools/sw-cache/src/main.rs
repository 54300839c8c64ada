//! Inspection tool for persisted service worker cache storage.
//!
//! Provides commands for:
//! - Listing scopes that have a database
//! - Listing the caches and entries of a scope
//! - Running a cache match the way a worker would
//! - Deleting a cache
//!
//! ## Usage
//!
//! ```bash
//! # List persisted scopes
//! sw-cache --data-dir ~/.local/share/rustkit/service-worker-caches scopes
//!
//! # List caches of a scope
//! sw-cache caches https://example.com/app/
//!
//! # Look up a request, ignoring the query string
//! sw-cache match https://example.com/app/ /app/index.html?v=2 --ignore-search --body
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr.

use clap::{ArgAction, Parser, Subcommand};
use rustkit_common::{init_logging, LogConfig, LogFormat};
use rustkit_sw::{CacheConfig, CacheStorageRegistry, MatchOptions};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;

mod inspect;

use inspect::InspectError;

#[derive(Parser)]
#[command(name = "sw-cache")]
#[command(about = "Inspect persisted service worker cache storage")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the configuration
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List scopes that have a database
    Scopes,

    /// List the caches of a scope
    Caches {
        /// Worker scope
        scope: String,
    },

    /// List cached requests of a scope
    Keys {
        /// Worker scope
        scope: String,
        /// Only this cache
        #[arg(long)]
        cache: Option<String>,
    },

    /// Look up a request; exits with 1 when nothing matches
    Match {
        /// Worker scope
        scope: String,
        /// Request URL, relative URLs resolve against the base URL
        url: String,
        /// Request method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// Only search this cache
        #[arg(long)]
        cache: Option<String>,
        /// Ignore the query string
        #[arg(long)]
        ignore_search: bool,
        /// Ignore the request method
        #[arg(long)]
        ignore_method: bool,
        /// Ignore the Vary header
        #[arg(long)]
        ignore_vary: bool,
        /// Include the body as text
        #[arg(long)]
        body: bool,
    },

    /// Delete a cache and its entries
    Delete {
        /// Worker scope
        scope: String,
        /// Cache name
        cache: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::for_verbosity(cli.verbose);
    if cli.json_logs {
        log_config = log_config.with_format(LogFormat::Json);
    }
    if let Err(e) = init_logging(log_config) {
        eprintln!("warning: logging disabled: {e}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, InspectError> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    // Inspection never seeds.
    config.preload_assets = false;
    debug!(data_dir = %config.data_dir.display(), "Opening cache storage registry");
    let registry = CacheStorageRegistry::new(config)?;

    match cli.command {
        Commands::Scopes => print_json(&inspect::list_scopes(&registry)?)?,

        Commands::Caches { scope } => {
            print_json(&inspect::list_caches(&registry, &scope).await?)?;
        }

        Commands::Keys { scope, cache } => {
            print_json(&inspect::list_keys(&registry, &scope, cache.as_deref()).await?)?;
        }

        Commands::Match {
            scope,
            url,
            method,
            cache,
            ignore_search,
            ignore_method,
            ignore_vary,
            body,
        } => {
            let request = inspect::lookup_request(&registry, &method, &url)?;
            let options = MatchOptions {
                ignore_search,
                ignore_method,
                ignore_vary,
                cache_name: cache,
            };

            let report = inspect::match_request(&registry, &scope, &request, &options, body).await?;
            let found = report.is_some();
            print_json(&report)?;
            if !found {
                return Ok(ExitCode::from(1));
            }
        }

        Commands::Delete { scope, cache } => {
            let deleted = inspect::delete_cache(&registry, &scope, &cache).await?;
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), InspectError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
