// Copyright (c) 2026 Farebox. MIT License.
// See LICENSE for details.

//! # Farebox Fare Terminal
//!
//! Entry point for the `farebox-terminal` binary. Opens the encrypted
//! local ledger, starts the background sync engine, and runs the tap loop.
//!
//! Card UIDs arrive one per line on stdin — the development stand-in for
//! the NFC reader collaborator, which delivers exactly the same thing: a
//! UID string per tap. Every tap is debited locally and immediately; the
//! network is never on the tap path.

mod cli;
mod http;
mod logging;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::Notify;

use farebox_core::config::{TerminalConfig, VaultConfig};
use farebox_core::ledger::{LedgerError, LocalLedger};
use farebox_core::sync::engine::{SyncEngine, SyncTransport};
use farebox_core::vault::Vault;

use cli::{Commands, TerminalCli};
use http::HttpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TerminalCli::parse();

    match cli.command {
        Commands::Run(args) => run_terminal(args).await,
        Commands::Version => {
            println!("farebox-terminal {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_terminal(args: cli::RunArgs) -> Result<()> {
    logging::init_logging("farebox_terminal=info,farebox_core=info");

    tracing::info!(
        terminal_id = %args.terminal_id,
        server = %args.server_url,
        data_dir = %args.data_dir.display(),
        fare = args.fare,
        "starting farebox-terminal"
    );

    // --- Vault and local ledger ---
    let salt = hex::decode(&args.salt).context("salt must be hex-encoded")?;
    let vault = Arc::new(Vault::new(&VaultConfig {
        passphrase: args.passphrase.clone(),
        salt,
    }));

    let config = TerminalConfig {
        terminal_id: args.terminal_id.clone(),
        fare: args.fare,
        starting_balance: args.starting_balance,
        retry_interval: Duration::from_secs(args.retry_secs),
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
    };

    let db_path = args.data_dir.join("ledger");
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data directory: {}", args.data_dir.display()))?;
    let ledger = Arc::new(
        LocalLedger::open(&db_path, vault, config.clone())
            .with_context(|| format!("failed to open ledger at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "local ledger opened");

    // --- Transport and sync engine ---
    let transport: Arc<dyn SyncTransport> = Arc::new(
        HttpTransport::new(&args.server_url, Duration::from_secs(args.timeout_secs))
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    let wake = Arc::new(Notify::new());
    let engine = SyncEngine::new(Arc::clone(&ledger), Arc::clone(&transport), config.clone());
    let mut engine_task = tokio::spawn(engine.run(Arc::clone(&wake)));

    println!("Terminal ready. Tap a card (UID per line) to pay {}.", format_amount(args.fare));

    // --- Tap loop ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("reading tap input")? {
                    Some(line) => {
                        let uid = line.trim();
                        if uid.is_empty() {
                            continue;
                        }
                        handle_tap(&ledger, &wake, uid, args.fare)?;
                    }
                    None => {
                        tracing::info!("tap input closed, shutting down");
                        break;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }
            res = &mut engine_task => {
                // The engine only exits on a ledger failure — the local
                // store can no longer be trusted, so stop taking taps.
                match res {
                    Ok(Err(e)) => return Err(e).context("sync engine stopped: ledger failure"),
                    Ok(Ok(())) => bail!("sync engine exited unexpectedly"),
                    Err(e) => return Err(e).context("sync engine task panicked"),
                }
            }
        }
    }

    // --- Final flush: one last sync attempt, then make everything durable.
    engine_task.abort();
    let mut final_engine = SyncEngine::new(Arc::clone(&ledger), transport, config);
    if let Err(e) = final_engine.drive_until_settled().await {
        tracing::warn!(error = %e, "final sync attempt failed");
    }
    ledger.flush().context("final ledger flush failed")?;
    tracing::info!("farebox-terminal stopped");
    Ok(())
}

/// Processes one tap: show the balance, debit the fare, poke the engine.
///
/// A tap always completes locally before any sync activity for it starts;
/// only ledger corruption stops the loop.
fn handle_tap(
    ledger: &Arc<LocalLedger>,
    wake: &Arc<Notify>,
    uid: &str,
    fare: u64,
) -> Result<()> {
    let uid = uid.to_uppercase();
    let card = ledger
        .get_or_create_card(&uid)
        .context("reading card record")?;
    println!("Card {uid}: balance {}", format_amount(card.balance));

    match ledger.record_debit(&uid, fare) {
        Ok(tx) => {
            println!(
                "Payment accepted. Fare {}, new balance {}.",
                format_amount(fare),
                format_amount(card.balance - fare),
            );
            tracing::debug!(transaction = %tx.transaction_id, "tap recorded");
            // Nudge the sync engine — a freshly recorded debit should go
            // out as soon as the network allows.
            wake.notify_one();
        }
        Err(LedgerError::InsufficientBalance { balance, amount }) => {
            println!(
                "Payment declined: balance {} below fare {}.",
                format_amount(balance),
                format_amount(amount),
            );
        }
        Err(e) => return Err(e).context("recording debit"),
    }
    Ok(())
}

/// Renders minor units as a decimal amount, e.g. 250 -> "2.50".
fn format_amount(minor: u64) -> String {
    format!("{}.{:02}", minor / 100, minor % 100)
}
