//! Terminal↔server synchronization: the wire vocabulary ([`wire`]) and the
//! terminal-side connectivity state machine ([`engine`]).
//!
//! The engine is transport-agnostic — it neither opens sockets nor parses
//! HTTP. Transport lives behind [`engine::SyncTransport`], which the
//! terminal binary implements over plain HTTP and tests implement with
//! scripted responses. Complexity lives in the engine, not the wire format.

pub mod engine;
pub mod wire;

pub use engine::{LinkState, SyncEngine, SyncTransport, TransportError};
pub use wire::{CardSnapshot, HeartbeatRequest, HeartbeatResponse, SyncRequest, SyncResponse, TxResult};
