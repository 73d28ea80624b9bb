//! # Local Ledger
//!
//! The terminal-resident, encrypted, offline-first store of card balances
//! and transactions. While the network is down — which is the normal case,
//! not the exception — this is the source of truth the terminal debits
//! against.
//!
//! ## Record layout
//!
//! One sled tree, keys namespaced by prefix so a single atomic batch can
//! cover a whole debit:
//!
//! | Key                      | Value                     |
//! |--------------------------|---------------------------|
//! | `card/{card_id}`         | `bincode(Card)`           |
//! | `tx/{sequence}` (8B BE)  | `bincode(Transaction)`    |
//! | `idx/{transaction_id}`   | `sequence` (8B BE)        |
//! | `meta/next_seq`          | next sequence (8B BE)     |
//!
//! Transactions are keyed by big-endian sequence number, so a prefix scan
//! replays them in exactly the order they happened. The `idx/` entries map
//! server-echoed transaction ids back to sequence keys for status updates.
//!
//! ## Atomicity
//!
//! `record_debit` writes the debited card, the PENDING transaction, its id
//! index, and the bumped sequence counter in one [`sled::Batch`]. A crash
//! mid-write leaves either the complete debit or nothing — there is no
//! recovery logic because there is no partial state to recover from.

use chrono::Utc;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::TerminalConfig;
use crate::store::{EncryptedStore, WriteOp};
use crate::types::{Card, RejectReason, Transaction, TxStatus};
use crate::vault::Vault;

use super::{LedgerError, LedgerResult};

const META_NEXT_SEQ: &[u8] = b"meta/next_seq";

fn card_key(card_id: &str) -> Vec<u8> {
    let mut key = b"card/".to_vec();
    key.extend_from_slice(card_id.as_bytes());
    key
}

fn tx_key(sequence: u64) -> Vec<u8> {
    let mut key = b"tx/".to_vec();
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn idx_key(id: &Uuid) -> Vec<u8> {
    let mut key = b"idx/".to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// Terminal-resident durable ledger.
///
/// A terminal processes one card at a time by design, but the sync engine
/// runs as a concurrent task, so every read-decide-write goes through one
/// internal mutex. The store's batches keep us crash-consistent; the mutex
/// keeps us race-free.
pub struct LocalLedger {
    store: EncryptedStore,
    config: TerminalConfig,
    /// Serializes all mutations (tap path vs. sync task).
    write_lock: Mutex<()>,
}

impl LocalLedger {
    /// Opens (or creates) the ledger at the given path.
    pub fn open<P: AsRef<Path>>(
        path: P,
        vault: Arc<Vault>,
        config: TerminalConfig,
    ) -> LedgerResult<Self> {
        let store = EncryptedStore::open(path, "ledger", vault)?;
        Ok(Self {
            store,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// In-memory ledger for tests.
    pub fn temporary(vault: Arc<Vault>, config: TerminalConfig) -> LedgerResult<Self> {
        let store = EncryptedStore::temporary("ledger", vault)?;
        Ok(Self {
            store,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// The terminal id this ledger records transactions under.
    pub fn terminal_id(&self) -> &str {
        &self.config.terminal_id
    }

    /// Returns the existing card, or issues one with the configured
    /// starting balance on first sight of the UID.
    pub fn get_or_create_card(&self, card_id: &str) -> LedgerResult<Card> {
        let _guard = self.write_lock.lock();
        self.load_or_issue(card_id)
    }

    /// Read-only card lookup; `None` for a UID this terminal has never seen.
    pub fn card(&self, card_id: &str) -> LedgerResult<Option<Card>> {
        match self.store.get(&card_key(card_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Debits a fare from a card and records the PENDING transaction,
    /// atomically.
    ///
    /// Fails with [`LedgerError::InsufficientBalance`] before anything is
    /// written — a refused tap leaves no trace in the ledger.
    pub fn record_debit(&self, card_id: &str, amount: u64) -> LedgerResult<Transaction> {
        let _guard = self.write_lock.lock();

        let mut card = self.load_or_issue(card_id)?;
        let Some(remaining) = card.balance.checked_sub(amount) else {
            return Err(LedgerError::InsufficientBalance {
                balance: card.balance,
                amount,
            });
        };
        card.balance = remaining;
        card.version += 1;

        let sequence = self.next_sequence()?;
        let tx = Transaction::debit(
            card_id,
            &self.config.terminal_id,
            amount,
            sequence,
            Utc::now(),
        );

        self.store.apply_batch(vec![
            WriteOp::Put {
                key: card_key(card_id),
                value: encode(&card)?,
            },
            WriteOp::Put {
                key: tx_key(sequence),
                value: encode(&tx)?,
            },
            WriteOp::Put {
                key: idx_key(&tx.transaction_id),
                value: sequence.to_be_bytes().to_vec(),
            },
            WriteOp::Put {
                key: META_NEXT_SEQ.to_vec(),
                value: (sequence + 1).to_be_bytes().to_vec(),
            },
        ])?;

        tracing::info!(
            card = card_id,
            amount,
            sequence,
            balance = card.balance,
            "debit recorded"
        );
        Ok(tx)
    }

    /// All PENDING transactions in sequence order.
    ///
    /// Restartable: re-querying after a crash returns the same set, minus
    /// anything marked since. This is what a sync batch is built from.
    pub fn pending_transactions(&self) -> LedgerResult<Vec<Transaction>> {
        let mut pending = Vec::new();
        for (_, bytes) in self.store.scan_prefix(b"tx/")? {
            let tx: Transaction = decode(&bytes)?;
            if tx.status == TxStatus::Pending {
                pending.push(tx);
            }
        }
        Ok(pending)
    }

    /// Marks transactions as transmitted to the server.
    pub fn mark_synced(&self, ids: &[Uuid]) -> LedgerResult<()> {
        self.update_status(ids, |tx| {
            tx.status = TxStatus::Synced;
        })
    }

    /// Marks transactions as applied by the authoritative ledger.
    pub fn mark_confirmed(&self, ids: &[Uuid]) -> LedgerResult<()> {
        self.update_status(ids, |tx| {
            tx.status = TxStatus::Confirmed;
            tx.reject_reason = None;
        })
    }

    /// Marks transactions as refused by the authoritative ledger.
    pub fn mark_rejected(&self, ids: &[Uuid], reason: RejectReason) -> LedgerResult<()> {
        self.update_status(ids, |tx| {
            tx.status = TxStatus::Rejected;
            tx.reject_reason = Some(reason);
        })
    }

    /// Overwrites the local balance with the server's authoritative state.
    ///
    /// Applied only when the server's version is newer than ours; the
    /// server is always authoritative on reconnect. A card we have never
    /// seen locally is created from the snapshot.
    pub fn apply_balance_correction(
        &self,
        card_id: &str,
        balance: u64,
        version: u64,
    ) -> LedgerResult<()> {
        let _guard = self.write_lock.lock();

        let mut card = self.load_or_issue(card_id)?;
        if version <= card.version {
            return Ok(());
        }
        tracing::info!(
            card = card_id,
            local_balance = card.balance,
            local_version = card.version,
            balance,
            version,
            "applying authoritative balance correction"
        );
        card.balance = balance;
        card.version = version;
        self.store.put(&card_key(card_id), &encode(&card)?)?;
        Ok(())
    }

    /// Full transaction history in sequence order, any status. The audit
    /// trail — records are never deleted.
    pub fn transactions(&self) -> LedgerResult<Vec<Transaction>> {
        self.store
            .scan_prefix(b"tx/")?
            .into_iter()
            .map(|(_, bytes)| decode(&bytes))
            .collect()
    }

    /// Blocks until everything is durable on disk. Called on shutdown.
    pub fn flush(&self) -> LedgerResult<()> {
        self.store.flush()?;
        Ok(())
    }

    // -- Internals ----------------------------------------------------------

    /// Loads a card or issues a fresh one. Caller holds the write lock.
    fn load_or_issue(&self, card_id: &str) -> LedgerResult<Card> {
        if let Some(bytes) = self.store.get(&card_key(card_id))? {
            return decode(&bytes);
        }
        let card = Card::issued(card_id, self.config.starting_balance);
        self.store.put(&card_key(card_id), &encode(&card)?)?;
        tracing::info!(
            card = card_id,
            balance = card.balance,
            "new card issued with starting balance"
        );
        Ok(card)
    }

    /// Allocates the next per-terminal sequence number. Starts at 1 and is
    /// gap-free: the counter is persisted in the same batch as the debit
    /// that consumed it.
    fn next_sequence(&self) -> LedgerResult<u64> {
        match self.store.get(META_NEXT_SEQ)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| LedgerError::Corrupt("bad sequence counter".into()))?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(1),
        }
    }

    fn update_status(
        &self,
        ids: &[Uuid],
        mutate: impl Fn(&mut Transaction),
    ) -> LedgerResult<()> {
        let _guard = self.write_lock.lock();

        let mut ops = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(seq_bytes) = self.store.get(&idx_key(id))? else {
                // The server echoed an id we never issued. Not fatal for
                // the rest of the batch, but worth a loud log line.
                tracing::warn!(transaction = %id, "status update for unknown transaction");
                continue;
            };
            let arr: [u8; 8] = seq_bytes
                .as_slice()
                .try_into()
                .map_err(|_| LedgerError::Corrupt("bad transaction index entry".into()))?;
            let key = tx_key(u64::from_be_bytes(arr));
            let bytes = self
                .store
                .get(&key)?
                .ok_or_else(|| LedgerError::Corrupt(format!("dangling index for {id}")))?;
            let mut tx: Transaction = decode(&bytes)?;
            mutate(&mut tx);
            ops.push(WriteOp::Put {
                key,
                value: encode(&tx)?,
            });
        }
        self.store.apply_batch(ops)?;
        Ok(())
    }
}

impl std::fmt::Debug for LocalLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLedger")
            .field("terminal_id", &self.config.terminal_id)
            .finish_non_exhaustive()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;

    fn ledger() -> LocalLedger {
        let vault = Arc::new(Vault::new(&VaultConfig {
            passphrase: "test".into(),
            salt: b"local_ledger_salt".to_vec(),
        }));
        let mut config = TerminalConfig::with_defaults("bus-42");
        config.starting_balance = 1_000;
        config.fare = 100;
        LocalLedger::temporary(vault, config).unwrap()
    }

    #[test]
    fn first_tap_issues_card_with_default_balance() {
        let ledger = ledger();
        let card = ledger.get_or_create_card("04A1").unwrap();
        assert_eq!(card.balance, 1_000);
        assert_eq!(card.version, 0);

        // Second lookup returns the same card, not a re-issue.
        let again = ledger.get_or_create_card("04A1").unwrap();
        assert_eq!(again, card);
    }

    #[test]
    fn debit_decrements_and_records_pending() {
        let ledger = ledger();
        ledger.get_or_create_card("04A1").unwrap();

        let tx = ledger.record_debit("04A1", 100).unwrap();
        assert_eq!(tx.status, TxStatus::Pending);
        assert_eq!(tx.sequence, 1);
        assert_eq!(tx.terminal_id, "bus-42");

        let card = ledger.card("04A1").unwrap().unwrap();
        assert_eq!(card.balance, 900);
        assert_eq!(card.version, 1);
    }

    #[test]
    fn debit_sum_matches_balance_delta() {
        // For all sequences of successful debits:
        // balance_after = balance_before - sum(amounts).
        let ledger = ledger();
        let amounts = [100u64, 250, 40, 10];
        for amount in amounts {
            ledger.record_debit("04A1", amount).unwrap();
        }
        let card = ledger.card("04A1").unwrap().unwrap();
        assert_eq!(card.balance, 1_000 - amounts.iter().sum::<u64>());
        assert_eq!(card.version, amounts.len() as u64);
    }

    #[test]
    fn debit_never_goes_negative() {
        let ledger = ledger();
        ledger.record_debit("04A1", 900).unwrap();

        let err = ledger.record_debit("04A1", 200).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                balance: 100,
                amount: 200
            }
        ));

        // The refused tap left no trace: balance untouched, no transaction.
        let card = ledger.card("04A1").unwrap().unwrap();
        assert_eq!(card.balance, 100);
        assert_eq!(ledger.transactions().unwrap().len(), 1);

        // An exact-balance debit still works.
        ledger.record_debit("04A1", 100).unwrap();
        assert_eq!(ledger.card("04A1").unwrap().unwrap().balance, 0);
    }

    #[test]
    fn sequences_are_gap_free_across_cards() {
        let ledger = ledger();
        let a = ledger.record_debit("04A1", 10).unwrap();
        let b = ledger.record_debit("04B2", 10).unwrap();
        let c = ledger.record_debit("04A1", 10).unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
    }

    #[test]
    fn pending_in_sequence_order_and_restartable() {
        let ledger = ledger();
        for _ in 0..4 {
            ledger.record_debit("04A1", 100).unwrap();
        }

        let pending = ledger.pending_transactions().unwrap();
        let seqs: Vec<_> = pending.iter().map(|t| t.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        // Re-querying yields the same set.
        assert_eq!(ledger.pending_transactions().unwrap(), pending);

        // Marking two removes exactly those from the pending view.
        ledger
            .mark_confirmed(&[pending[0].transaction_id, pending[1].transaction_id])
            .unwrap();
        let rest = ledger.pending_transactions().unwrap();
        assert_eq!(rest.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn status_transitions_preserve_audit_trail() {
        let ledger = ledger();
        let tx = ledger.record_debit("04A1", 100).unwrap();

        ledger.mark_synced(&[tx.transaction_id]).unwrap();
        ledger
            .mark_rejected(&[tx.transaction_id], RejectReason::InsufficientFunds)
            .unwrap();

        let all = ledger.transactions().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TxStatus::Rejected);
        assert_eq!(all[0].reject_reason, Some(RejectReason::InsufficientFunds));
        assert!(ledger.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn unknown_id_in_status_update_is_skipped() {
        let ledger = ledger();
        let tx = ledger.record_debit("04A1", 100).unwrap();
        let bogus = Uuid::new_v4();

        // Must not fail the batch; the known id still gets updated.
        ledger.mark_confirmed(&[bogus, tx.transaction_id]).unwrap();
        assert!(ledger.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn correction_overwrites_only_when_newer() {
        let ledger = ledger();
        ledger.record_debit("04A1", 100).unwrap(); // balance 900, version 1

        // Stale server version: ignored.
        ledger.apply_balance_correction("04A1", 123, 1).unwrap();
        assert_eq!(ledger.card("04A1").unwrap().unwrap().balance, 900);

        // Newer server version: server wins.
        ledger.apply_balance_correction("04A1", 1_400, 5).unwrap();
        let card = ledger.card("04A1").unwrap().unwrap();
        assert_eq!(card.balance, 1_400);
        assert_eq!(card.version, 5);
    }

    #[test]
    fn correction_for_unseen_card_creates_it() {
        let ledger = ledger();
        ledger.apply_balance_correction("04FF", 777, 3).unwrap();
        let card = ledger.card("04FF").unwrap().unwrap();
        assert_eq!(card.balance, 777);
        assert_eq!(card.version, 3);
    }

    #[test]
    fn ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vault = || {
            Arc::new(Vault::new(&VaultConfig {
                passphrase: "test".into(),
                salt: b"local_ledger_salt".to_vec(),
            }))
        };
        let mut config = TerminalConfig::with_defaults("bus-42");
        config.starting_balance = 1_000;

        let tx = {
            let ledger = LocalLedger::open(dir.path(), vault(), config.clone()).unwrap();
            let tx = ledger.record_debit("04A1", 100).unwrap();
            ledger.flush().unwrap();
            tx
        };

        let ledger = LocalLedger::open(dir.path(), vault(), config).unwrap();
        assert_eq!(ledger.card("04A1").unwrap().unwrap().balance, 900);
        let pending = ledger.pending_transactions().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transaction_id, tx.transaction_id);

        // The next sequence continues where the crash left off — replaying
        // the same tap would re-derive the same id, a fresh tap gets a new one.
        let next = ledger.record_debit("04A1", 100).unwrap();
        assert_eq!(next.sequence, 2);
    }
}
