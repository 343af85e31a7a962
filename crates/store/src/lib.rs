//! Ordered key/value persistence for the index sets and per-node
//! statistics. The contract is narrow: point reads and writes, ascending
//! prefix iteration, and atomic multi-key transactions with crash-safe
//! commit. Two backends exist, an in-memory map for tests and embedders,
//! and RocksDB for durable deployments.

use std::sync::Arc;

pub mod config;
pub mod db;
mod tx;

pub use config::StoreConfig;
pub use db::{Database, InMemoryDb, RocksDb};
pub use tx::{Operation, Transaction};

/// Shared handle to a database. All index sets in the process hold clones
/// of one `Store`; none of them owns the backend.
#[derive(Clone)]
pub struct Store {
    db: Arc<dyn Database>,
}

impl Store {
    pub fn open<T: Database + 'static>(config: &StoreConfig) -> eyre::Result<Self> {
        let db = T::open(config)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Wraps an already-open backend; used by tests and in-process setups.
    pub fn new<T: Database + 'static>(db: T) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn get(&self, key: &[u8]) -> eyre::Result<Option<Vec<u8>>> {
        self.db.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> eyre::Result<()> {
        self.db.put(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> eyre::Result<()> {
        self.db.delete(key)
    }

    /// All entries whose key starts with `prefix`, in ascending key order.
    pub fn iter_prefix(&self, prefix: &[u8]) -> eyre::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.db.iter_prefix(prefix)
    }

    /// Applies every operation in `tx` as one atomic commit.
    pub fn apply(&self, tx: Transaction) -> eyre::Result<()> {
        self.db.apply(tx)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
