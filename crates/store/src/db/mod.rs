mod memory;
mod rocksdb;

pub use memory::InMemoryDb;
pub use rocksdb::RocksDb;

use crate::config::StoreConfig;
use crate::tx::Transaction;

/// The backend contract: an ordered byte keyspace with atomic multi-key
/// writes. Implementations must make `apply` crash safe, so that after a
/// crash the keyspace reflects either none or all of a transaction.
pub trait Database: Send + Sync {
    fn open(config: &StoreConfig) -> eyre::Result<Self>
    where
        Self: Sized;

    fn get(&self, key: &[u8]) -> eyre::Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> eyre::Result<()>;

    fn delete(&self, key: &[u8]) -> eyre::Result<()>;

    fn iter_prefix(&self, prefix: &[u8]) -> eyre::Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn apply(&self, tx: Transaction) -> eyre::Result<()>;
}
