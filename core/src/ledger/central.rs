//! # Central Ledger
//!
//! The server-resident, authoritative record: card balances, the global
//! set of confirmed transactions, and the terminal registry. Every terminal
//! in the fleet eventually reconciles against this.
//!
//! ## Record layout
//!
//! | Key                     | Value                    |
//! |-------------------------|--------------------------|
//! | `card/{card_id}`        | `bincode(Card)`          |
//! | `tx/{transaction_id}`   | `bincode(Transaction)`   |
//! | `term/{terminal_id}`    | `bincode(TerminalRecord)`|
//!
//! Only confirmed transactions are stored — a transaction id in the `tx/`
//! namespace means it was applied, exactly once. Rejections are returned to
//! the submitting terminal (which keeps its own audit record) and logged.
//!
//! ## Concurrency discipline
//!
//! [`CentralLedger::apply_transaction`] is the single read-decide-write for
//! a card, serialized per card through a lock table: two terminals debiting
//! the same card race through here one at a time, so they can never both
//! read the same stale balance and both succeed when only one should.
//! Different cards proceed fully in parallel. Heartbeats are independent
//! single-key writes and take no lock at all.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::APPLY_RETRY_LIMIT;
use crate::store::{EncryptedStore, StoreError, WriteOp};
use crate::types::{
    Card, ConnectivityState, RejectReason, TerminalRecord, Transaction, TxKind, TxStatus,
};
use crate::vault::Vault;

use super::{LedgerError, LedgerResult};

/// Origin marker recorded on server-originated correction transactions.
/// Not a real terminal id; corrections carry no terminal sequence.
const CENTRAL_ORIGIN: &str = "central";

fn card_key(card_id: &str) -> Vec<u8> {
    let mut key = b"card/".to_vec();
    key.extend_from_slice(card_id.as_bytes());
    key
}

fn tx_key(id: &Uuid) -> Vec<u8> {
    let mut key = b"tx/".to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn term_key(terminal_id: &str) -> Vec<u8> {
    let mut key = b"term/".to_vec();
    key.extend_from_slice(terminal_id.as_bytes());
    key
}

/// The verdict of [`CentralLedger::apply_transaction`] for one transaction,
/// together with the card snapshot the terminal should reconcile against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// `Confirmed` or `Rejected`; never any other status.
    pub status: TxStatus,
    /// Populated when `status` is `Rejected`.
    pub reason: Option<RejectReason>,
    /// The card's authoritative state after the decision.
    pub card: Card,
}

impl ApplyOutcome {
    fn confirmed(card: Card) -> Self {
        Self {
            status: TxStatus::Confirmed,
            reason: None,
            card,
        }
    }

    fn rejected(reason: RejectReason, card: Card) -> Self {
        Self {
            status: TxStatus::Rejected,
            reason: Some(reason),
            card,
        }
    }
}

/// Authoritative card state and the global confirmed-transaction set.
pub struct CentralLedger {
    store: EncryptedStore,
    /// Per-card serialization points for `apply_transaction` and `credit`.
    /// Entries are created on first touch and never removed; the table is
    /// bounded by the card population.
    card_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Balance granted to a card on first sight of its UID.
    starting_balance: u64,
}

impl CentralLedger {
    /// Opens (or creates) the ledger at the given path.
    pub fn open<P: AsRef<Path>>(
        path: P,
        vault: Arc<Vault>,
        starting_balance: u64,
    ) -> LedgerResult<Self> {
        let store = EncryptedStore::open(path, "central", vault)?;
        Ok(Self {
            store,
            card_locks: DashMap::new(),
            starting_balance,
        })
    }

    /// In-memory ledger for tests.
    pub fn temporary(vault: Arc<Vault>, starting_balance: u64) -> LedgerResult<Self> {
        let store = EncryptedStore::temporary("central", vault)?;
        Ok(Self {
            store,
            card_locks: DashMap::new(),
            starting_balance,
        })
    }

    /// Applies one terminal-submitted transaction: the atomic
    /// read-decide-write at the heart of reconciliation.
    ///
    /// Outcomes, in decision order:
    ///
    /// - already confirmed with an identical amount → `Confirmed`, no
    ///   balance delta (idempotent replay — the safe-retry path);
    /// - already confirmed with a *different* amount →
    ///   `Rejected(ConflictingDuplicate)` — an id-generation bug or
    ///   tampering, logged loudly and never silently overwritten;
    /// - a kind terminals may not originate → `Rejected(UnsupportedKind)`;
    /// - balance would underflow → `Rejected(InsufficientFunds)`;
    /// - otherwise: debit, bump version, store as confirmed, return the
    ///   new snapshot.
    pub fn apply_transaction(&self, tx: &Transaction) -> LedgerResult<ApplyOutcome> {
        let lock = self.card_lock(&tx.card_id);
        let _guard = lock.lock();

        // Dedupe before anything else: replay must not even read balances.
        if let Some(bytes) = self.store.get(&tx_key(&tx.transaction_id))? {
            let prior: Transaction = decode(&bytes)?;
            let card = self.load_or_issue(&tx.card_id)?;
            if prior.amount == tx.amount && prior.kind == tx.kind {
                tracing::debug!(
                    transaction = %tx.transaction_id,
                    "duplicate submission, confirming idempotently"
                );
                return Ok(ApplyOutcome::confirmed(card));
            }
            tracing::warn!(
                transaction = %tx.transaction_id,
                prior_amount = prior.amount,
                amount = tx.amount,
                terminal = %tx.terminal_id,
                "conflicting duplicate: same id, different payload"
            );
            return Ok(ApplyOutcome::rejected(
                RejectReason::ConflictingDuplicate,
                card,
            ));
        }

        match tx.kind {
            TxKind::Debit => {}
            TxKind::Correction => {
                // Credits originate here, never at a terminal.
                let card = self.load_or_issue(&tx.card_id)?;
                tracing::warn!(
                    transaction = %tx.transaction_id,
                    terminal = %tx.terminal_id,
                    "terminal submitted a correction; rejecting"
                );
                return Ok(ApplyOutcome::rejected(RejectReason::UnsupportedKind, card));
            }
        }

        let mut card = self.load_or_issue(&tx.card_id)?;
        let Some(remaining) = card.balance.checked_sub(tx.amount) else {
            tracing::info!(
                transaction = %tx.transaction_id,
                card = %tx.card_id,
                balance = card.balance,
                amount = tx.amount,
                "rejecting debit: insufficient authoritative funds"
            );
            return Ok(ApplyOutcome::rejected(RejectReason::InsufficientFunds, card));
        };
        card.balance = remaining;
        card.version += 1;

        let mut confirmed = tx.clone();
        confirmed.status = TxStatus::Confirmed;
        confirmed.reject_reason = None;

        self.commit(vec![
            WriteOp::Put {
                key: card_key(&tx.card_id),
                value: encode(&card)?,
            },
            WriteOp::Put {
                key: tx_key(&tx.transaction_id),
                value: encode(&confirmed)?,
            },
        ])?;

        tracing::info!(
            transaction = %tx.transaction_id,
            card = %tx.card_id,
            amount = tx.amount,
            balance = card.balance,
            version = card.version,
            "debit confirmed"
        );
        Ok(ApplyOutcome::confirmed(card))
    }

    /// Credits a card — the server-originated top-up. Recorded in the
    /// confirmed set as a `Correction` and propagated to terminals as a
    /// balance correction on their next sync.
    pub fn credit(&self, card_id: &str, amount: u64) -> LedgerResult<Card> {
        let lock = self.card_lock(card_id);
        let _guard = lock.lock();

        let mut card = self.load_or_issue(card_id)?;
        card.balance = card
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::AmountOverflow { amount })?;
        card.version += 1;

        let record = Transaction {
            transaction_id: Uuid::new_v4(),
            card_id: card_id.to_string(),
            terminal_id: CENTRAL_ORIGIN.to_string(),
            kind: TxKind::Correction,
            amount,
            sequence: 0,
            created_at: Utc::now(),
            status: TxStatus::Confirmed,
            reject_reason: None,
        };

        self.commit(vec![
            WriteOp::Put {
                key: card_key(card_id),
                value: encode(&card)?,
            },
            WriteOp::Put {
                key: tx_key(&record.transaction_id),
                value: encode(&record)?,
            },
        ])?;

        tracing::info!(
            card = card_id,
            amount,
            balance = card.balance,
            version = card.version,
            "credit applied"
        );
        Ok(card)
    }

    /// Read-only authoritative snapshot; `None` for an unknown UID.
    pub fn get_card(&self, card_id: &str) -> LedgerResult<Option<Card>> {
        match self.store.get(&card_key(card_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns the existing card, or registers one with the default
    /// starting balance on first sight of the UID.
    pub fn get_or_create_card(&self, card_id: &str) -> LedgerResult<Card> {
        let lock = self.card_lock(card_id);
        let _guard = lock.lock();
        self.load_or_issue(card_id)
    }

    /// Confirmed history for one card, oldest first.
    pub fn card_transactions(&self, card_id: &str) -> LedgerResult<Vec<Transaction>> {
        let mut txs: Vec<Transaction> = self
            .store
            .scan_prefix(b"tx/")?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect::<LedgerResult<Vec<_>>>()?
            .into_iter()
            .filter(|tx: &Transaction| tx.card_id == card_id)
            .collect();
        txs.sort_by_key(|tx| tx.created_at);
        Ok(txs)
    }

    /// Number of confirmed transactions across all cards.
    pub fn confirmed_count(&self) -> LedgerResult<usize> {
        Ok(self.store.scan_prefix(b"tx/")?.len())
    }

    /// Number of registered cards.
    pub fn card_count(&self) -> LedgerResult<usize> {
        Ok(self.store.scan_prefix(b"card/")?.len())
    }

    // -- Terminal registry --------------------------------------------------

    /// Refreshes a terminal's registration. Lock-free: a single keyed write,
    /// called on every heartbeat and every sync.
    pub fn record_heartbeat(&self, terminal_id: &str, at: DateTime<Utc>) -> LedgerResult<()> {
        let record = TerminalRecord {
            terminal_id: terminal_id.to_string(),
            last_heartbeat: at,
            connectivity: ConnectivityState::Online,
        };
        self.store.put(&term_key(terminal_id), &encode(&record)?)?;
        Ok(())
    }

    /// All registered terminals, in id order.
    pub fn terminals(&self) -> LedgerResult<Vec<TerminalRecord>> {
        self.store
            .scan_prefix(b"term/")?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    /// Blocks until everything is durable on disk.
    pub fn flush(&self) -> LedgerResult<()> {
        self.store.flush()?;
        Ok(())
    }

    // -- Internals ----------------------------------------------------------

    fn card_lock(&self, card_id: &str) -> Arc<Mutex<()>> {
        self.card_locks
            .entry(card_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Loads a card or issues a fresh one. Caller holds the card lock.
    fn load_or_issue(&self, card_id: &str) -> LedgerResult<Card> {
        if let Some(bytes) = self.store.get(&card_key(card_id))? {
            return decode(&bytes);
        }
        let card = Card::issued(card_id, self.starting_balance);
        self.store.put(&card_key(card_id), &encode(&card)?)?;
        tracing::info!(card = card_id, balance = card.balance, "card registered");
        Ok(card)
    }

    /// Commits a batch, retrying transient storage failures a bounded
    /// number of times before surfacing them. The submitting terminal
    /// leaves its batch pending and retries on its own cycle — no nested
    /// retry amplification.
    fn commit(&self, ops: Vec<WriteOp>) -> LedgerResult<()> {
        let mut attempt = 0;
        loop {
            match self.store.apply_batch(ops.clone()) {
                Ok(()) => return Ok(()),
                Err(StoreError::Sled(e)) if attempt < APPLY_RETRY_LIMIT => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "storage commit failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for CentralLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralLedger").finish_non_exhaustive()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> LedgerResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| LedgerError::Corrupt(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> LedgerResult<T> {
    bincode::deserialize(bytes).map_err(|e| LedgerError::Corrupt(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
