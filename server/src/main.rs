// Copyright (c) 2026 Farebox. MIT License.
// See LICENSE for details.

//! # Farebox Central Ledger Server
//!
//! Entry point for the `farebox-server` binary. Parses CLI arguments,
//! initializes logging and metrics, opens the encrypted central ledger,
//! and serves the terminal-facing HTTP API.

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;

use farebox_core::config::VaultConfig;
use farebox_core::ledger::CentralLedger;
use farebox_core::reconcile::Reconciler;
use farebox_core::vault::Vault;

use cli::{Commands, ServerCli};
use logging::LogFormat;
use metrics::ServerMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ServerCli::parse();

    match cli.command {
        Commands::Run(args) => run_server(args).await,
        Commands::Version => {
            println!("farebox-server {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Starts the full server: ledger, reconciler, API, and metrics endpoint.
async fn run_server(args: cli::RunArgs) -> Result<()> {
    let format = if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init_logging("farebox_server=info,farebox_core=info,tower_http=debug", format);

    tracing::info!(
        port = args.port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting farebox-server"
    );

    // --- Vault ---
    let salt = hex::decode(&args.salt).context("salt must be hex-encoded")?;
    let vault = Arc::new(Vault::new(&VaultConfig {
        passphrase: args.passphrase.clone(),
        salt,
    }));
    tracing::info!("storage key derived");

    // --- Central ledger ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let central = Arc::new(
        CentralLedger::open(&db_path, vault, args.starting_balance)
            .with_context(|| format!("failed to open ledger at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "central ledger opened");

    // --- Reconciler and metrics ---
    let reconciler = Arc::new(Reconciler::new(Arc::clone(&central)));
    let server_metrics = Arc::new(ServerMetrics::new());

    // --- Application state ---
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: Utc::now(),
        central: Arc::clone(&central),
        reconciler,
        metrics: Arc::clone(&server_metrics),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&server_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining connections");
        }
    }

    central.flush().context("final ledger flush failed")?;
    tracing::info!("farebox-server stopped");
    Ok(())
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
