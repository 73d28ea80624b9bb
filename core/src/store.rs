//! # Encrypted Store
//!
//! The key/row layer both ledgers sit on: a sled tree whose values pass
//! through the [`Vault`] on the way in and out. Keys stay plaintext — they
//! carry no financial data and sled's lexicographic ordering is what gives
//! us cheap in-order replay of transactions.
//!
//! ## Key layout
//!
//! Callers namespace keys with short prefixes (`card/`, `tx/`, `meta/`) so
//! that one logical record set shares a tree and one [`sled::Batch`] can
//! cover a whole multi-record write. Sequence-numbered keys use big-endian
//! `u64` bytes so lexicographic order equals numeric order.
//!
//! ## Atomicity
//!
//! [`EncryptedStore::apply_batch`] stages every write and commits them as a
//! single sled batch: either every record lands or none do, including
//! across a crash mid-write. The ledgers rely on this to keep a balance
//! update and its transaction record inseparable.

use sled::{Batch, Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::vault::{Vault, VaultError};

/// Errors from the encrypted store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// A stored value failed decryption. Surfaced as-is so callers can
    /// treat it as the data-corruption alarm it is, distinct from a
    /// missing key (which is `Ok(None)`).
    #[error("stored record unreadable: {0}")]
    Vault(#[from] VaultError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single staged write for [`EncryptedStore::apply_batch`].
#[derive(Clone)]
pub enum WriteOp {
    /// Insert or overwrite `key` with the sealed form of `value`.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove `key` if present.
    Remove { key: Vec<u8> },
}

/// A sled tree with values encrypted at rest.
///
/// Thread safety comes from sled: concurrent reads are lock-free and
/// writes are serialized per batch, so an `Arc<EncryptedStore>` can be
/// shared across tasks without extra locking. Callers that need
/// read-decide-write atomicity (the ledgers do) bring their own lock.
pub struct EncryptedStore {
    /// Underlying database handle, kept so `flush` reaches the whole db.
    db: Db,
    /// The namespaced tree all records live in.
    tree: Tree,
    /// Seals values on `put`, opens them on `get`.
    vault: Arc<Vault>,
}

impl EncryptedStore {
    /// Opens (or creates) an encrypted store at the given path, using a
    /// named tree inside the database.
    pub fn open<P: AsRef<Path>>(path: P, tree: &str, vault: Arc<Vault>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, tree, vault)
    }

    /// Opens a temporary in-memory store that vanishes on drop. Unit tests
    /// only — no filesystem side effects, no cleanup.
    pub fn temporary(tree: &str, vault: Arc<Vault>) -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, tree, vault)
    }

    fn from_db(db: Db, tree: &str, vault: Arc<Vault>) -> StoreResult<Self> {
        let tree = db.open_tree(tree)?;
        Ok(Self { db, tree, vault })
    }

    /// Reads and decrypts a record.
    ///
    /// A missing key is `Ok(None)`. A present key whose value fails
    /// authentication is `Err(StoreError::Vault(Integrity))` — the caller
    /// must not conflate the two.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.tree.get(key)? {
            Some(sealed) => Ok(Some(self.vault.open(&sealed)?)),
            None => Ok(None),
        }
    }

    /// Seals and writes a single record.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let sealed = self.vault.seal(value)?;
        self.tree.insert(key, sealed)?;
        Ok(())
    }

    /// Commits a set of writes atomically: all land or none do.
    pub fn apply_batch(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let mut batch = Batch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => {
                    batch.insert(key, self.vault.seal(&value)?);
                }
                WriteOp::Remove { key } => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// Returns all `(key, value)` pairs under a prefix, in key order,
    /// values decrypted. Sequence-numbered keys come back in numeric order
    /// thanks to their big-endian encoding.
    pub fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, sealed) = entry?;
            let value = self.vault.open(&sealed)?;
            out.push((key.to_vec(), value));
        }
        Ok(out)
    }

    /// Number of records in the tree. Counts everything under every prefix.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True when the tree holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Blocks until all buffered writes are durable on disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("records", &self.tree.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;

    fn vault() -> Arc<Vault> {
        Arc::new(Vault::new(&VaultConfig {
            passphrase: "store-test".into(),
            salt: b"store_salt".to_vec(),
        }))
    }

    #[test]
    fn put_get_roundtrip() {
        let store = EncryptedStore::temporary("ledger", vault()).unwrap();
        store.put(b"card/04A1", b"hello").unwrap();
        assert_eq!(store.get(b"card/04A1").unwrap().unwrap(), b"hello");
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let store = EncryptedStore::temporary("ledger", vault()).unwrap();
        assert!(store.get(b"card/none").unwrap().is_none());
    }

    #[test]
    fn values_are_sealed_on_disk() {
        let store = EncryptedStore::temporary("ledger", vault()).unwrap();
        store.put(b"card/04A1", b"balance 5000").unwrap();

        // Read the raw tree bytes: the plaintext must not be there.
        let raw = store.tree.get(b"card/04A1").unwrap().unwrap();
        assert_ne!(raw.as_ref(), b"balance 5000");
        assert!(raw.len() > b"balance 5000".len());
    }

    #[test]
    fn wrong_key_surfaces_integrity_not_absence() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let a = EncryptedStore::from_db(db.clone(), "ledger", vault()).unwrap();
        a.put(b"card/04A1", b"balance 5000").unwrap();

        let other = Arc::new(Vault::new(&VaultConfig {
            passphrase: "different".into(),
            salt: b"store_salt".to_vec(),
        }));
        let b = EncryptedStore::from_db(db, "ledger", other).unwrap();

        match b.get(b"card/04A1") {
            Err(StoreError::Vault(VaultError::Integrity)) => {}
            other => panic!("expected integrity error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let store = EncryptedStore::temporary("ledger", vault()).unwrap();
        store
            .apply_batch(vec![
                WriteOp::Put {
                    key: b"card/04A1".to_vec(),
                    value: b"a".to_vec(),
                },
                WriteOp::Put {
                    key: b"tx/0001".to_vec(),
                    value: b"b".to_vec(),
                },
                WriteOp::Put {
                    key: b"meta/seq".to_vec(),
                    value: b"c".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(store.len(), 3);
        assert_eq!(store.get(b"card/04A1").unwrap().unwrap(), b"a");
        assert_eq!(store.get(b"tx/0001").unwrap().unwrap(), b"b");
    }

    #[test]
    fn batch_remove() {
        let store = EncryptedStore::temporary("ledger", vault()).unwrap();
        store.put(b"meta/tmp", b"x").unwrap();
        store
            .apply_batch(vec![WriteOp::Remove {
                key: b"meta/tmp".to_vec(),
            }])
            .unwrap();
        assert!(store.get(b"meta/tmp").unwrap().is_none());
    }

    #[test]
    fn scan_prefix_in_sequence_order() {
        let store = EncryptedStore::temporary("ledger", vault()).unwrap();
        // Insert out of order; big-endian keys must come back sorted.
        for seq in [3u64, 1, 2] {
            let mut key = b"tx/".to_vec();
            key.extend_from_slice(&seq.to_be_bytes());
            store.put(&key, format!("tx-{seq}").as_bytes()).unwrap();
        }
        store.put(b"card/04A1", b"not a tx").unwrap();

        let txs = store.scan_prefix(b"tx/").unwrap();
        assert_eq!(txs.len(), 3);
        let values: Vec<_> = txs
            .iter()
            .map(|(_, v)| String::from_utf8(v.clone()).unwrap())
            .collect();
        assert_eq!(values, vec!["tx-1", "tx-2", "tx-3"]);
    }

    #[test]
    fn reopen_from_disk_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = EncryptedStore::open(dir.path(), "ledger", vault()).unwrap();
            store.put(b"card/04A1", b"persisted").unwrap();
            store.flush().unwrap();
        }
        let store = EncryptedStore::open(dir.path(), "ledger", vault()).unwrap();
        assert_eq!(store.get(b"card/04A1").unwrap().unwrap(), b"persisted");
    }
}
