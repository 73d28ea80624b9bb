//! # Sync Protocol Engine
//!
//! The terminal side of reconciliation: a four-state connectivity machine
//! that batches pending transactions, ships them to the server, interprets
//! the acknowledgement, and pulls authoritative balance corrections back
//! into the local ledger.
//!
//! ```text
//!             timer / tap
//!   OFFLINE ──────────────> CONNECTING
//!      ^                        │ heartbeat ok
//!      │ heartbeat fail         v
//!      ├──────────────────── ONLINE <─────────────┐
//!      │                        │ pending exist   │ batch acknowledged
//!      │ submit fail            v                 │
//!      └──────────────────── SYNCING ─────────────┘
//! ```
//!
//! ## Design decisions
//!
//! - **Transport-injected.** The engine never opens a socket. The terminal
//!   binary supplies an HTTP [`SyncTransport`]; tests supply scripted ones.
//!   Every network call is an explicit suspension point, so the machine is
//!   fully deterministic under test.
//! - **No partial marking.** A submit that fails mid-flight leaves every
//!   transaction PENDING. Re-sending is safe — the server dedupes on the
//!   deterministic transaction id — so at-least-once is the whole retry
//!   story.
//! - **No retry storm.** A failed attempt costs a full retry interval.
//!   One slow server outage must not become a fleet-wide reconnect
//!   stampede.
//! - **Taps never wait.** The engine runs beside the tap path, not inside
//!   it. A terminal keeps accepting taps against its last-known balances
//!   for as long as the network stays down, bounded only by storage.

use async_trait::async_trait;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::TerminalConfig;
use crate::ledger::{LedgerResult, LocalLedger};
use crate::sync::wire::{HeartbeatRequest, HeartbeatResponse, SyncRequest, SyncResponse};
use crate::types::TxStatus;

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Network-call failures. Always transient by definition: the only correct
/// reaction is to go offline and try again a full interval later.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

/// The two calls a terminal makes. Implemented over HTTP by the terminal
/// binary and over function calls by tests.
///
/// Implementations own the timeout: a call that exceeds the configured
/// network timeout must come back as [`TransportError::Timeout`], never
/// hang the engine.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Liveness probe; also refreshes the server's terminal registry.
    async fn heartbeat(&self, req: HeartbeatRequest)
        -> Result<HeartbeatResponse, TransportError>;

    /// Submits a batch of pending transactions for reconciliation.
    async fn submit(&self, req: SyncRequest) -> Result<SyncResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Connectivity state of the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No server contact; taps accumulate locally.
    Offline,
    /// A heartbeat is being attempted.
    Connecting,
    /// Server reachable, nothing to send.
    Online,
    /// A batch submit is in flight. At most one, ever — this is what
    /// guarantees the server sees same-terminal batches sequentially.
    Syncing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offline => write!(f, "OFFLINE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Online => write!(f, "ONLINE"),
            Self::Syncing => write!(f, "SYNCING"),
        }
    }
}

/// The terminal's sync driver.
///
/// Owns its state; runs as one background task per terminal. All ledger
/// access goes through the shared [`LocalLedger`], whose internal lock
/// keeps the engine and the tap path from interleaving mid-record.
pub struct SyncEngine {
    ledger: Arc<LocalLedger>,
    transport: Arc<dyn SyncTransport>,
    config: TerminalConfig,
    state: LinkState,
}

impl SyncEngine {
    /// Builds an engine in the initial OFFLINE state.
    pub fn new(
        ledger: Arc<LocalLedger>,
        transport: Arc<dyn SyncTransport>,
        config: TerminalConfig,
    ) -> Self {
        Self {
            ledger,
            transport,
            config,
            state: LinkState::Offline,
        }
    }

    /// Current state, for status display and tests.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Drives exactly one transition of the state machine.
    ///
    /// Errors are ledger failures (the integrity alarm included) — network
    /// failures are not errors here, they are transitions to OFFLINE.
    pub async fn step(&mut self) -> LedgerResult<LinkState> {
        let next = match self.state {
            LinkState::Offline => LinkState::Connecting,

            LinkState::Connecting => match self.send_heartbeat().await {
                Ok(resp) => {
                    tracing::info!(server_time = %resp.server_time, "connected to server");
                    LinkState::Online
                }
                Err(e) => {
                    tracing::debug!(error = %e, "heartbeat failed; staying offline");
                    LinkState::Offline
                }
            },

            LinkState::Online => {
                if self.ledger.pending_transactions()?.is_empty() {
                    // Idle: keep the registration fresh, notice link loss.
                    match self.send_heartbeat().await {
                        Ok(_) => LinkState::Online,
                        Err(e) => {
                            tracing::info!(error = %e, "lost server connection");
                            LinkState::Offline
                        }
                    }
                } else {
                    LinkState::Syncing
                }
            }

            LinkState::Syncing => {
                let pending = self.ledger.pending_transactions()?;
                if pending.is_empty() {
                    LinkState::Online
                } else {
                    let count = pending.len();
                    let req = SyncRequest {
                        terminal_id: self.config.terminal_id.clone(),
                        transactions: pending,
                    };
                    match self.transport.submit(req).await {
                        Ok(resp) => {
                            self.apply_acknowledgement(resp)?;
                            LinkState::Online
                        }
                        Err(e) => {
                            // Mid-flight failure: everything stays PENDING.
                            // The server may or may not have applied the
                            // batch; the deterministic ids make the resend
                            // harmless either way.
                            tracing::warn!(
                                error = %e,
                                count,
                                "sync failed mid-flight; batch remains pending"
                            );
                            LinkState::Offline
                        }
                    }
                }
            }
        };

        if next != self.state {
            tracing::debug!(from = %self.state, to = %next, "link state transition");
        }
        self.state = next;
        Ok(next)
    }

    /// Steps the machine until it settles: parked OFFLINE after a failure,
    /// or ONLINE with nothing left to send. One settle is one full sync
    /// attempt; the run loop calls this once per wake-up.
    ///
    /// The step budget bounds the attempt when a misbehaving server keeps
    /// acknowledging without issuing verdicts — the leftovers wait for the
    /// next cycle instead of hot-looping here.
    pub async fn drive_until_settled(&mut self) -> LedgerResult<LinkState> {
        const MAX_STEPS_PER_ATTEMPT: u32 = 32;

        for _ in 0..MAX_STEPS_PER_ATTEMPT {
            let before = self.state;
            let after = self.step().await?;
            let settled = after == LinkState::Offline
                || (before == LinkState::Online && after == LinkState::Online);
            if settled {
                return Ok(after);
            }
        }
        tracing::warn!(state = %self.state, "sync attempt exceeded step budget; parking until next cycle");
        Ok(self.state)
    }

    /// The background task: wakes on the cadence timer or on a tap poke,
    /// drives a full attempt, and goes back to sleep. Runs until the task
    /// is dropped. Only ledger failures escape — surface them, they mean
    /// the local store can no longer be trusted.
    pub async fn run(mut self, wake: Arc<Notify>) -> LedgerResult<()> {
        // First attempt immediately on startup, like a terminal coming
        // back from a power cut with a night's worth of taps queued.
        self.drive_until_settled().await?;

        loop {
            let interval = match self.state {
                LinkState::Offline => self.config.retry_interval,
                _ => self.config.heartbeat_interval,
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
            }
            self.drive_until_settled().await?;
        }
    }

    // -- Internals ----------------------------------------------------------

    async fn send_heartbeat(&self) -> Result<HeartbeatResponse, TransportError> {
        self.transport
            .heartbeat(HeartbeatRequest {
                terminal_id: self.config.terminal_id.clone(),
                timestamp: Utc::now(),
            })
            .await
    }

    /// Applies a server acknowledgement: statuses per result, balance
    /// corrections per returned card. A transaction whose result is
    /// malformed is left PENDING and rides the next batch — resending is
    /// free, losing a verdict is not.
    fn apply_acknowledgement(&self, resp: SyncResponse) -> LedgerResult<()> {
        let mut acknowledged: Vec<Uuid> = Vec::new();
        let mut confirmed: Vec<Uuid> = Vec::new();
        let mut rejected = Vec::new();

        for result in &resp.results {
            match (result.status, result.reason) {
                (TxStatus::Confirmed, _) => {
                    acknowledged.push(result.transaction_id);
                    confirmed.push(result.transaction_id);
                }
                (TxStatus::Rejected, Some(reason)) => {
                    acknowledged.push(result.transaction_id);
                    rejected.push((result.transaction_id, reason));
                }
                (status, reason) => {
                    tracing::warn!(
                        transaction = %result.transaction_id,
                        status = %status,
                        ?reason,
                        "malformed sync result; leaving transaction pending"
                    );
                }
            }
        }

        // Record the transmission stage first, then the verdicts: the
        // audit trail reads Pending → Synced → Confirmed/Rejected.
        self.ledger.mark_synced(&acknowledged)?;
        self.ledger.mark_confirmed(&confirmed)?;
        for (id, reason) in &rejected {
            self.ledger.mark_rejected(&[*id], *reason)?;
            tracing::warn!(transaction = %id, reason = %reason, "transaction rejected by server");
        }

        for snap in &resp.cards {
            self.ledger
                .apply_balance_correction(&snap.card_id, snap.balance, snap.version)?;
        }

        tracing::info!(
            confirmed = confirmed.len(),
            rejected = rejected.len(),
            corrections = resp.cards.len(),
            "sync batch acknowledged"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
