// Copyright (c) 2026 Farebox. MIT License.
// See LICENSE for details.

//! # Farebox — Core Library
//!
//! The transaction engine behind Farebox fare terminals: NFC-card payments
//! at unattended terminals that may lose network connectivity for hours or
//! days, reconciled against a central authoritative ledger when the link
//! comes back.
//!
//! The hard problems all live here: double-spend prevention, lost-transaction
//! recovery, balance divergence between many terminals and one server, and
//! replay-safe retransmission. Everything else (NFC drivers, TLS plumbing,
//! the HTTP shell) is a collaborator at the boundary.
//!
//! ## Architecture
//!
//! The crate is split into modules that mirror the actual concerns of an
//! offline-first payment edge:
//!
//! - **config** — Every constant and tuning knob, in one place.
//! - **vault** — Passphrase-derived keys and authenticated encryption for
//!   everything that touches disk. Plaintext balances on an unattended
//!   terminal are an invitation.
//! - **store** — The encrypted key/row layer both ledgers sit on.
//! - **types** — Cards, transactions, and the deterministic transaction id
//!   that makes retries safe.
//! - **ledger** — The terminal-resident local ledger and the server-resident
//!   central ledger.
//! - **sync** — The wire vocabulary and the terminal's connectivity state
//!   machine.
//! - **reconcile** — Server-side batch ingest: dedupe, conflict detection,
//!   atomic balance application.
//!
//! ## Design Philosophy
//!
//! 1. The server is authoritative; terminals are optimistic caches.
//! 2. Every network send is at-least-once; every apply is exactly-once.
//! 3. Integer minor units everywhere. No floating point anywhere near money.
//! 4. A corrupted record is an alarm, never a silent zero.

pub mod config;
pub mod ledger;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod types;
pub mod vault;
