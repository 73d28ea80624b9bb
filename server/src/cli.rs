//! # CLI Interface
//!
//! Command-line argument structure for `farebox-server` using `clap`
//! derive. Two subcommands: `run` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Farebox central ledger server.
///
/// Holds the authoritative card balances and the global confirmed
/// transaction set, reconciles sync batches from fare terminals, and
/// exposes the fleet HTTP API plus Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "farebox-server",
    about = "Farebox central ledger server",
    version,
    propagate_version = true
)]
pub struct ServerCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the central ledger server.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Data directory for the encrypted ledger database.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "FAREBOX_DATA_DIR", default_value = "./farebox-server-data")]
    pub data_dir: PathBuf,

    /// Port for the terminal-facing HTTP API.
    #[arg(long, env = "FAREBOX_PORT", default_value_t = farebox_core::config::DEFAULT_API_PORT)]
    pub port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "FAREBOX_METRICS_PORT", default_value_t = farebox_core::config::DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Passphrase the at-rest encryption key is derived from.
    ///
    /// Prefer the environment variable over the flag — flags leak into
    /// shell history and process listings.
    #[arg(long, env = "FAREBOX_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,

    /// Hex-encoded key-derivation salt. Per-deployment and stable:
    /// changing it orphans every record written under the old salt.
    #[arg(long, env = "FAREBOX_SALT", hide_env_values = true)]
    pub salt: String,

    /// Balance granted to a card on first sight of its UID, in minor units.
    #[arg(long, env = "FAREBOX_STARTING_BALANCE", default_value_t = farebox_core::config::DEFAULT_STARTING_BALANCE)]
    pub starting_balance: u64,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, env = "FAREBOX_LOG_JSON")]
    pub log_json: bool,
}
