//! # Configuration & Constants
//!
//! Every magic number in Farebox lives here. Fare amounts, key-derivation
//! cost, retry cadence — if it tunes behavior, it has a name and a doc
//! comment in this file.
//!
//! Runtime configuration is carried in small immutable structs
//! ([`VaultConfig`], [`TerminalConfig`]) that are built once at startup and
//! passed explicitly into the vault, the ledgers, and the sync engine.
//! There is no process-wide mutable configuration state.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Key Derivation
// ---------------------------------------------------------------------------

/// PBKDF2-HMAC-SHA256 iteration count for deriving the storage key from
/// the operator passphrase. 100 000 iterations is deliberately expensive:
/// an attacker who lifts the encrypted database from a stolen terminal has
/// to pay this cost per passphrase guess. Changing this value invalidates
/// every existing encrypted store, so treat it as frozen.
pub const KDF_ITERATIONS: u32 = 100_000;

/// AES-256-GCM key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-256-GCM nonce length in bytes. 96 bits is the standard GCM nonce
/// size and the only one we use.
pub const AES_NONCE_LENGTH: usize = 12;

// ---------------------------------------------------------------------------
// Fare Policy
// ---------------------------------------------------------------------------

/// Default fare per tap, in minor currency units (cents). 250 = 2.50.
pub const DEFAULT_FARE: u64 = 250;

/// Balance assigned to a card the first time its UID is seen, in minor
/// units. 5000 = 50.00. New cards start funded so the pilot fleet works
/// without a separate issuance flow.
pub const DEFAULT_STARTING_BALANCE: u64 = 5_000;

// ---------------------------------------------------------------------------
// Sync Cadence
// ---------------------------------------------------------------------------

/// How long a terminal waits after a failed connection attempt before
/// trying again. One failed heartbeat costs a full interval — there is no
/// fast-retry path, which keeps a fleet of offline terminals from turning
/// a server outage into a reconnect storm.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// How often an idle, connected terminal heartbeats the server. Keeps the
/// server-side terminal registry fresh without meaningful load.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Hard timeout for a single network call (heartbeat or batch submit).
/// After this, the call counts as failed and the state machine drops to
/// offline. Card taps are never blocked on this timeout — they complete
/// locally regardless of network state.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// How many times the central ledger retries a storage commit that failed
/// transiently before surfacing the error to the terminal. The terminal
/// simply leaves the batch pending for the next cycle, so a small bound
/// is enough.
pub const APPLY_RETRY_LIMIT: u32 = 3;

/// Default port for the central-ledger HTTP API.
pub const DEFAULT_API_PORT: u16 = 8443;

/// Default port for the Prometheus metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 8444;

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Inputs for deriving the at-rest encryption key.
///
/// Built once from operator-supplied CLI/env values and handed to
/// [`crate::vault::Vault::new`]. The passphrase never appears anywhere
/// else — not in logs, not in the store, not on the wire.
#[derive(Clone)]
pub struct VaultConfig {
    /// Operator passphrase the storage key is derived from.
    pub passphrase: String,
    /// Key-derivation salt. Per-deployment, not secret, but must be stable:
    /// changing it orphans every record written under the old salt.
    pub salt: Vec<u8>,
}

impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The passphrase stays out of Debug output. The salt is not secret
        // but there is no reason to print it either.
        f.debug_struct("VaultConfig").finish_non_exhaustive()
    }
}

/// Per-terminal runtime configuration.
///
/// Immutable after construction and shared by the local ledger and the
/// sync engine.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Identifier this terminal signs its transactions with. Must be unique
    /// across the fleet; sequence numbers are scoped to it.
    pub terminal_id: String,
    /// Fare debited per tap, in minor units.
    pub fare: u64,
    /// Balance granted to a card on first sight, in minor units.
    pub starting_balance: u64,
    /// Interval between connection attempts while offline.
    pub retry_interval: Duration,
    /// Interval between heartbeats while online and idle.
    pub heartbeat_interval: Duration,
}

impl TerminalConfig {
    /// Builds a config with fleet-default fare policy and cadence for the
    /// given terminal id.
    pub fn with_defaults(terminal_id: impl Into<String>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            fare: DEFAULT_FARE,
            starting_balance: DEFAULT_STARTING_BALANCE,
            retry_interval: RETRY_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_cost_is_frozen() {
        // Lowering this silently weakens every deployed terminal; raising it
        // orphans existing stores. Either way, a failing test is the point.
        assert_eq!(KDF_ITERATIONS, 100_000);
    }

    #[test]
    fn fare_fits_starting_balance() {
        // A fresh card must afford at least one ride, or the default
        // issuance flow is useless.
        assert!(DEFAULT_FARE <= DEFAULT_STARTING_BALANCE);
        assert!(DEFAULT_FARE > 0);
    }

    #[test]
    fn timing_constants_sanity() {
        // A network call must be able to fail well within one retry window,
        // otherwise attempts overlap.
        assert!(NETWORK_TIMEOUT < RETRY_INTERVAL);
        assert!(RETRY_INTERVAL <= HEARTBEAT_INTERVAL);
    }

    #[test]
    fn terminal_config_defaults() {
        let cfg = TerminalConfig::with_defaults("bus-42");
        assert_eq!(cfg.terminal_id, "bus-42");
        assert_eq!(cfg.fare, DEFAULT_FARE);
        assert_eq!(cfg.starting_balance, DEFAULT_STARTING_BALANCE);
    }

    #[test]
    fn vault_config_debug_hides_passphrase() {
        let cfg = VaultConfig {
            passphrase: "hunter2".into(),
            salt: b"salt".to_vec(),
        };
        let debug = format!("{:?}", cfg);
        assert!(!debug.contains("hunter2"));
    }
}
