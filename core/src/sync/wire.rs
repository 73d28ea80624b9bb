//! Request and response bodies for the terminal↔server protocol.
//!
//! These are intentionally dumb: serde structs, JSON on the wire, one
//! request per response. A sync batch is a payload, not an entity — it has
//! no identity of its own and is never persisted as a unit. The
//! deduplication that makes retransmission safe hangs entirely off the
//! deterministic transaction ids inside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Card, RejectReason, Transaction, TxStatus};

/// `POST /heartbeat` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub terminal_id: String,
    /// The terminal's local clock, for skew diagnostics on the server.
    pub timestamp: DateTime<Utc>,
}

/// `POST /heartbeat` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub server_time: DateTime<Utc>,
}

/// `POST /sync` request body: one terminal's pending transactions, in
/// local sequence order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub terminal_id: String,
    pub transactions: Vec<Transaction>,
}

/// The server's verdict on one submitted transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub transaction_id: Uuid,
    /// `Confirmed` or `Rejected`.
    pub status: TxStatus,
    /// Present when `status` is `Rejected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

/// Authoritative card state returned alongside sync results. The terminal
/// overwrites its local copy when `version` is newer than its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub card_id: String,
    pub balance: u64,
    pub version: u64,
}

impl From<Card> for CardSnapshot {
    fn from(card: Card) -> Self {
        Self {
            card_id: card.card_id,
            balance: card.balance,
            version: card.version,
        }
    }
}

/// `POST /sync` response body: per-transaction verdicts in submission
/// order, plus a snapshot for every card the batch touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub results: Vec<TxResult>,
    pub cards: Vec<CardSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxKind;

    #[test]
    fn sync_request_json_roundtrip() {
        let req = SyncRequest {
            terminal_id: "bus-42".into(),
            transactions: vec![Transaction::debit("04A1", "bus-42", 250, 1, Utc::now())],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: SyncRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.terminal_id, "bus-42");
        assert_eq!(back.transactions.len(), 1);
        assert_eq!(back.transactions[0].kind, TxKind::Debit);
    }

    #[test]
    fn rejected_result_carries_reason() {
        let result = TxResult {
            transaction_id: Transaction::derive_id("04A1", "bus-42", 1),
            status: TxStatus::Rejected,
            reason: Some(RejectReason::InsufficientFunds),
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("InsufficientFunds"));

        let back: TxResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reason, Some(RejectReason::InsufficientFunds));
    }

    #[test]
    fn confirmed_result_omits_reason_field() {
        let result = TxResult {
            transaction_id: Transaction::derive_id("04A1", "bus-42", 1),
            status: TxStatus::Confirmed,
            reason: None,
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn card_snapshot_from_card() {
        let snap: CardSnapshot = Card {
            card_id: "04A1".into(),
            balance: 400,
            version: 6,
        }
        .into();
        assert_eq!(snap.balance, 400);
        assert_eq!(snap.version, 6);
    }
}
