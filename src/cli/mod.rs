//! CLI for Baton.
//!
//! # Commands
//!
//! - `serve` - run the proxy
//! - `check` - validate and print the server-list config
//! - `completions` - generate shell completions
//!
//! # Example
//!
//! ```bash
//! # Run with the default server-list.json
//! baton serve
//!
//! # Validate a config before deploying it
//! baton check --config staging/server-list.json
//! ```

pub mod check;
pub mod completions;
pub mod serve;

pub use completions::handle_completions;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Baton - model-aware reverse proxy for local LLM fleets
#[derive(Parser, Debug)]
#[command(
    name = "baton",
    version,
    about = "Model-aware reverse proxy for local LLM inference fleets"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the proxy server
    Serve(ServeArgs),
    /// Validate and print the server-list config
    Check(CheckArgs),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to the server-list config file
    #[arg(short, long, env = "SERVER_LIST_JSON", default_value = "server-list.json")]
    pub config: PathBuf,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port
    #[arg(short, long, default_value_t = 18000)]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "BATON_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the server-list config file
    #[arg(short, long, env = "SERVER_LIST_JSON", default_value = "server-list.json")]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: clap_complete::Shell,
}
