//! Core type definitions for cards, transactions, and terminal registry
//! entries.
//!
//! All money is integer minor units (cents). Balances are unsigned because
//! policy forbids negative balances outright — a debit that would underflow
//! is rejected before it exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Card
// ---------------------------------------------------------------------------

/// A fare card, identified by its NFC UID.
///
/// `version` increments on every balance-affecting operation and is how the
/// sync protocol detects that one side is stale: the higher version wins,
/// and the server's copy is authoritative on reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// NFC UID as read from the card, hex-uppercase by convention.
    pub card_id: String,
    /// Balance in minor currency units. Never negative by policy.
    pub balance: u64,
    /// Monotonic version, bumped on every balance change.
    pub version: u64,
}

impl Card {
    /// A freshly issued card with the configured starting balance.
    pub fn issued(card_id: impl Into<String>, starting_balance: u64) -> Self {
        Self {
            card_id: card_id.into(),
            balance: starting_balance,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// What a transaction does to a balance.
///
/// Closed set with exhaustive handling at every consumer. Debits originate
/// at terminals; corrections (top-ups and other credits) originate only at
/// the server — a terminal has no business inventing money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxKind {
    /// A fare payment: subtracts `amount` from the card.
    Debit,
    /// A server-originated credit: adds `amount` to the card.
    Correction,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debit => write!(f, "Debit"),
            Self::Correction => write!(f, "Correction"),
        }
    }
}

/// Lifecycle state of a transaction.
///
/// `Pending` from the moment of the tap, `Synced` once the server has
/// received it, `Confirmed` once the server reports it applied, `Rejected`
/// when the server refuses it. Records never leave this set and are never
/// deleted — the ledger is an append-only audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    /// Recorded locally, not yet transmitted.
    Pending,
    /// Transmitted to the server in a sync batch.
    Synced,
    /// Applied to the authoritative ledger.
    Confirmed,
    /// Refused by the authoritative ledger; see the reject reason.
    Rejected,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Synced => write!(f, "Synced"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Rejected => write!(f, "Rejected"),
        }
    }
}

/// Why the authoritative ledger refused a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    /// The card's authoritative balance cannot cover the amount. The
    /// terminal's cached balance had diverged; it must pull the correction
    /// rather than retry unchanged.
    InsufficientFunds,
    /// A transaction with this id was already confirmed with a different
    /// amount. Indicates an id-generation bug or tampering; logged and
    /// rejected, never auto-resolved.
    ConflictingDuplicate,
    /// The batch carried a kind terminals may not originate.
    UnsupportedKind,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientFunds => write!(f, "InsufficientFunds"),
            Self::ConflictingDuplicate => write!(f, "ConflictingDuplicate"),
            Self::UnsupportedKind => write!(f, "UnsupportedKind"),
        }
    }
}

/// Namespace for deriving transaction ids. Fixed forever: changing it would
/// re-identify every historical transaction.
const TX_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0xa2, 0x1c, 0x5e, 0x8d, 0x3b, 0x47, 0x19, 0x9c, 0x02, 0xe4, 0x55, 0x7a, 0xb8, 0xd1,
    0x30,
]);

/// One balance-affecting event, recorded on the terminal that produced it
/// and, once confirmed, in the central ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Deterministic identity — see [`Transaction::derive_id`]. This is the
    /// idempotency key that makes at-least-once retransmission safe.
    pub transaction_id: Uuid,
    /// The card this transaction touches.
    pub card_id: String,
    /// The terminal that originated it (or the server's own origin marker
    /// for corrections).
    pub terminal_id: String,
    /// What the transaction does to the balance.
    pub kind: TxKind,
    /// Magnitude in minor units. Direction comes from `kind`.
    pub amount: u64,
    /// Per-terminal sequence number: strictly increasing, gap-free from the
    /// terminal's own perspective.
    pub sequence: u64,
    /// Wall-clock time at the originating device.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: TxStatus,
    /// Populated only when `status` is `Rejected`.
    pub reject_reason: Option<RejectReason>,
}

impl Transaction {
    /// Derives the transaction id from the logical identity of a tap.
    ///
    /// UUIDv5 over a fixed namespace and `"card:terminal:sequence"`. The id
    /// is a pure function of its inputs, so re-sending the same logical
    /// transaction after a crash or timeout produces the same identifier —
    /// which is exactly what lets the server deduplicate replays.
    pub fn derive_id(card_id: &str, terminal_id: &str, sequence: u64) -> Uuid {
        let name = format!("{card_id}:{terminal_id}:{sequence}");
        Uuid::new_v5(&TX_ID_NAMESPACE, name.as_bytes())
    }

    /// Builds a fresh PENDING debit for a tap.
    pub fn debit(
        card_id: impl Into<String>,
        terminal_id: impl Into<String>,
        amount: u64,
        sequence: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let card_id = card_id.into();
        let terminal_id = terminal_id.into();
        Self {
            transaction_id: Self::derive_id(&card_id, &terminal_id, sequence),
            card_id,
            terminal_id,
            kind: TxKind::Debit,
            amount,
            sequence,
            created_at,
            status: TxStatus::Pending,
            reject_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal registry
// ---------------------------------------------------------------------------

/// Connectivity as last reported by (or observed about) a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// The terminal has heartbeated recently.
    Online,
    /// No recent heartbeat.
    Offline,
}

/// Server-owned registration record for one terminal, refreshed on every
/// heartbeat or sync call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalRecord {
    pub terminal_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub connectivity: ConnectivityState,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
