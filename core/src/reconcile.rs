//! # Reconciliation Service
//!
//! The server side of a sync: ingest one terminal's batch, apply each
//! transaction against the central ledger in the order the terminal
//! recorded them, and hand back per-transaction verdicts plus authoritative
//! snapshots for every card the batch touched.
//!
//! Concurrency contract: batches from *different* terminals run in
//! parallel — per-card serialization inside
//! [`CentralLedger::apply_transaction`] is the only synchronization they
//! need. Batches from the *same* terminal never overlap, because the
//! terminal's state machine allows at most one SYNCING submission in
//! flight; the service does not re-enforce that here.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ledger::{CentralLedger, LedgerResult};
use crate::sync::wire::{
    CardSnapshot, HeartbeatRequest, HeartbeatResponse, SyncRequest, SyncResponse, TxResult,
};
use crate::types::TxStatus;

/// Stateless front door to the central ledger for terminal traffic.
pub struct Reconciler {
    central: Arc<CentralLedger>,
}

impl Reconciler {
    pub fn new(central: Arc<CentralLedger>) -> Self {
        Self { central }
    }

    /// Handles a terminal heartbeat: refresh its registration, return the
    /// server clock.
    pub fn heartbeat(&self, req: &HeartbeatRequest) -> LedgerResult<HeartbeatResponse> {
        let now = Utc::now();
        self.central.record_heartbeat(&req.terminal_id, now)?;
        tracing::debug!(
            terminal = %req.terminal_id,
            terminal_time = %req.timestamp,
            "heartbeat"
        );
        Ok(HeartbeatResponse { server_time: now })
    }

    /// Reconciles one sync batch.
    ///
    /// Transactions are applied strictly in the order received — which is
    /// the terminal's sequence order — so verdicts line up index-for-index
    /// with the submission. The returned snapshots carry the final state of
    /// every touched card after the whole batch, which is what the terminal
    /// corrects its cache against.
    pub fn reconcile(&self, req: SyncRequest) -> LedgerResult<SyncResponse> {
        let batch_size = req.transactions.len();
        let mut results = Vec::with_capacity(batch_size);
        // BTreeMap for deterministic card order in the response; later
        // outcomes for the same card overwrite earlier, staler snapshots.
        let mut cards: BTreeMap<String, CardSnapshot> = BTreeMap::new();

        for tx in &req.transactions {
            let outcome = self.central.apply_transaction(tx)?;
            results.push(TxResult {
                transaction_id: tx.transaction_id,
                status: outcome.status,
                reason: outcome.reason,
            });
            cards.insert(tx.card_id.clone(), outcome.card.into());
        }

        // A sync counts as liveness just like a heartbeat does.
        self.central.record_heartbeat(&req.terminal_id, Utc::now())?;

        let confirmed = results
            .iter()
            .filter(|r| r.status == TxStatus::Confirmed)
            .count();
        tracing::info!(
            terminal = %req.terminal_id,
            batch_size,
            confirmed,
            rejected = batch_size - confirmed,
            "sync batch reconciled"
        );

        Ok(SyncResponse {
            results,
            cards: cards.into_values().collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::types::{RejectReason, Transaction, TxKind};
    use crate::vault::Vault;

    fn reconciler(starting_balance: u64) -> (Reconciler, Arc<CentralLedger>) {
        let vault = Arc::new(Vault::new(&VaultConfig {
            passphrase: "reconcile-test".into(),
            salt: b"reconcile_salt".to_vec(),
        }));
        let central = Arc::new(CentralLedger::temporary(vault, starting_balance).unwrap());
        (Reconciler::new(Arc::clone(&central)), central)
    }

    fn batch(terminal: &str, txs: Vec<Transaction>) -> SyncRequest {
        SyncRequest {
            terminal_id: terminal.into(),
            transactions: txs,
        }
    }

    fn debits(terminal: &str, card: &str, amounts: &[u64]) -> Vec<Transaction> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                Transaction::debit(card, terminal, *amount, (i + 1) as u64, Utc::now())
            })
            .collect()
    }

    #[test]
    fn batch_applied_in_order_with_final_snapshot() {
        let (reconciler, central) = reconciler(1_000);
        let resp = reconciler
            .reconcile(batch("bus-42", debits("bus-42", "04A1", &[100, 200, 300])))
            .unwrap();

        assert_eq!(resp.results.len(), 3);
        assert!(resp.results.iter().all(|r| r.status == TxStatus::Confirmed));

        // One snapshot per touched card, reflecting the whole batch.
        assert_eq!(resp.cards.len(), 1);
        assert_eq!(resp.cards[0].balance, 400);
        assert_eq!(resp.cards[0].version, 3);
        assert_eq!(central.get_card("04A1").unwrap().unwrap().balance, 400);
    }

    #[test]
    fn results_line_up_with_submission_order() {
        let (reconciler, _) = reconciler(1_000);
        let txs = debits("bus-42", "04A1", &[600, 600, 100]);
        let ids: Vec<_> = txs.iter().map(|t| t.transaction_id).collect();

        let resp = reconciler.reconcile(batch("bus-42", txs)).unwrap();

        let result_ids: Vec<_> = resp.results.iter().map(|r| r.transaction_id).collect();
        assert_eq!(result_ids, ids);
        // First 600 lands, second overdraws, the 100 still fits after it.
        assert_eq!(resp.results[0].status, TxStatus::Confirmed);
        assert_eq!(resp.results[1].status, TxStatus::Rejected);
        assert_eq!(
            resp.results[1].reason,
            Some(RejectReason::InsufficientFunds)
        );
        assert_eq!(resp.results[2].status, TxStatus::Confirmed);
        assert_eq!(resp.cards[0].balance, 300);
    }

    #[test]
    fn resubmitting_a_batch_changes_nothing() {
        // Idempotence: the second submission confirms everything again and
        // the balance has moved exactly once.
        let (reconciler, central) = reconciler(1_000);
        let txs = debits("bus-42", "04A1", &[100, 100, 100]);

        reconciler.reconcile(batch("bus-42", txs.clone())).unwrap();
        let again = reconciler.reconcile(batch("bus-42", txs)).unwrap();

        assert!(again.results.iter().all(|r| r.status == TxStatus::Confirmed));
        assert_eq!(central.get_card("04A1").unwrap().unwrap().balance, 700);
        assert_eq!(central.confirmed_count().unwrap(), 3);
    }

    #[test]
    fn conflicting_duplicate_in_batch_rejected() {
        let (reconciler, central) = reconciler(1_000);
        let mut txs = debits("bus-42", "04A1", &[250]);
        // Same logical tap, tampered amount.
        let mut forged = txs[0].clone();
        forged.amount = 1;
        txs.push(forged);

        let resp = reconciler.reconcile(batch("bus-42", txs)).unwrap();
        assert_eq!(resp.results[0].status, TxStatus::Confirmed);
        assert_eq!(resp.results[1].status, TxStatus::Rejected);
        assert_eq!(
            resp.results[1].reason,
            Some(RejectReason::ConflictingDuplicate)
        );
        // Only the first write counted.
        assert_eq!(central.get_card("04A1").unwrap().unwrap().balance, 750);
    }

    #[test]
    fn correction_from_terminal_rejected() {
        let (reconciler, central) = reconciler(1_000);
        let mut tx = Transaction::debit("04A1", "bus-42", 500, 1, Utc::now());
        tx.kind = TxKind::Correction;

        let resp = reconciler.reconcile(batch("bus-42", vec![tx])).unwrap();
        assert_eq!(resp.results[0].status, TxStatus::Rejected);
        assert_eq!(resp.results[0].reason, Some(RejectReason::UnsupportedKind));
        assert_eq!(central.get_card("04A1").unwrap().unwrap().balance, 1_000);
    }

    #[test]
    fn batch_touching_many_cards_snapshots_each_once() {
        let (reconciler, _) = reconciler(1_000);
        let txs = vec![
            Transaction::debit("04A1", "bus-42", 100, 1, Utc::now()),
            Transaction::debit("04B2", "bus-42", 200, 2, Utc::now()),
            Transaction::debit("04A1", "bus-42", 50, 3, Utc::now()),
        ];

        let resp = reconciler.reconcile(batch("bus-42", txs)).unwrap();
        assert_eq!(resp.cards.len(), 2);
        let a1 = resp.cards.iter().find(|c| c.card_id == "04A1").unwrap();
        let b2 = resp.cards.iter().find(|c| c.card_id == "04B2").unwrap();
        // 04A1's snapshot reflects both of its debits, not just the first.
        assert_eq!(a1.balance, 850);
        assert_eq!(b2.balance, 800);
    }

    #[test]
    fn sync_and_heartbeat_both_refresh_registration() {
        let (reconciler, central) = reconciler(1_000);

        reconciler
            .heartbeat(&HeartbeatRequest {
                terminal_id: "bus-7".into(),
                timestamp: Utc::now(),
            })
            .unwrap();
        reconciler
            .reconcile(batch("bus-42", debits("bus-42", "04A1", &[100])))
            .unwrap();

        let terminals = central.terminals().unwrap();
        let ids: Vec<_> = terminals.iter().map(|t| t.terminal_id.as_str()).collect();
        assert!(ids.contains(&"bus-7"));
        assert!(ids.contains(&"bus-42"));
    }

    #[test]
    fn empty_batch_is_a_no_op_with_heartbeat() {
        let (reconciler, central) = reconciler(1_000);
        let resp = reconciler.reconcile(batch("bus-42", Vec::new())).unwrap();
        assert!(resp.results.is_empty());
        assert!(resp.cards.is_empty());
        assert_eq!(central.terminals().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_batches_from_different_terminals() {
        use std::thread;

        // Two terminals, disjoint cards, simultaneous batches. Both must
        // land completely; per-card locks are the only contention.
        let (reconciler, central) = reconciler(1_000);
        let reconciler = Arc::new(reconciler);

        let handles: Vec<_> = ["bus-1", "bus-2"]
            .into_iter()
            .map(|terminal| {
                let reconciler = Arc::clone(&reconciler);
                let card = format!("CARD-{terminal}");
                thread::spawn(move || {
                    let txs = debits(terminal, &card, &[100, 100, 100]);
                    reconciler.reconcile(batch(terminal, txs)).unwrap()
                })
            })
            .collect();

        for handle in handles {
            let resp = handle.join().unwrap();
            assert!(resp.results.iter().all(|r| r.status == TxStatus::Confirmed));
        }
        assert_eq!(central.get_card("CARD-bus-1").unwrap().unwrap().balance, 700);
        assert_eq!(central.get_card("CARD-bus-2").unwrap().unwrap().balance, 700);
    }
}
