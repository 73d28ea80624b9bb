//! # CLI Interface
//!
//! Command-line argument structure for `farebox-terminal` using `clap`
//! derive. Two subcommands: `run` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Farebox fare terminal.
///
/// Reads card taps, debits fares against the local encrypted ledger, and
/// reconciles with the central server whenever the network allows. Keeps
/// working through arbitrarily long outages.
#[derive(Parser, Debug)]
#[command(
    name = "farebox-terminal",
    about = "Farebox fare terminal",
    version,
    propagate_version = true
)]
pub struct TerminalCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the terminal: tap loop plus background sync.
    Run(RunArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Base URL of the central ledger server, e.g. `http://10.0.0.5:8443`.
    ///
    /// Plain HTTP: TLS termination is handled by the fronting proxy that
    /// owns the certificates, not by this binary.
    #[arg(long, env = "FAREBOX_SERVER_URL")]
    pub server_url: String,

    /// Data directory for the encrypted local ledger.
    #[arg(long, short = 'd', env = "FAREBOX_DATA_DIR", default_value = "./farebox-terminal-data")]
    pub data_dir: PathBuf,

    /// Stable identifier for this terminal.
    ///
    /// Must be unique across the fleet and must never change for a given
    /// device: transaction ids and sequence numbers are derived from it,
    /// and a renamed terminal would restart its sequence from scratch.
    #[arg(long, env = "FAREBOX_TERMINAL_ID")]
    pub terminal_id: String,

    /// Fare debited per tap, in minor units.
    #[arg(long, env = "FAREBOX_FARE", default_value_t = farebox_core::config::DEFAULT_FARE)]
    pub fare: u64,

    /// Balance granted to a card on first sight, in minor units.
    #[arg(long, env = "FAREBOX_STARTING_BALANCE", default_value_t = farebox_core::config::DEFAULT_STARTING_BALANCE)]
    pub starting_balance: u64,

    /// Passphrase the at-rest encryption key is derived from.
    #[arg(long, env = "FAREBOX_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,

    /// Hex-encoded key-derivation salt. Stable per deployment.
    #[arg(long, env = "FAREBOX_SALT", hide_env_values = true)]
    pub salt: String,

    /// Seconds between connection attempts while offline.
    #[arg(long, env = "FAREBOX_RETRY_SECS", default_value_t = 30)]
    pub retry_secs: u64,

    /// Seconds between heartbeats while online and idle.
    #[arg(long, env = "FAREBOX_HEARTBEAT_SECS", default_value_t = 60)]
    pub heartbeat_secs: u64,

    /// Hard timeout in seconds for a single network call.
    #[arg(long, env = "FAREBOX_TIMEOUT_SECS", default_value_t = 5)]
    pub timeout_secs: u64,
}
