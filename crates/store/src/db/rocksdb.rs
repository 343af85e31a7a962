use rocksdb::{Direction, IteratorMode, WriteBatch, DB};

use crate::config::StoreConfig;
use crate::db::Database;
use crate::tx::{Operation, Transaction};

/// Durable backend. `apply` maps to a `WriteBatch`, which RocksDB commits
/// atomically through its write-ahead log.
pub struct RocksDb {
    inner: DB,
}

impl Database for RocksDb {
    fn open(config: &StoreConfig) -> eyre::Result<Self> {
        let mut options = rocksdb::Options::default();
        options.create_if_missing(true);

        let inner = DB::open(&options, config.path.as_std_path())?;

        Ok(Self { inner })
    }

    fn get(&self, key: &[u8]) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key)?)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> eyre::Result<()> {
        self.inner.put(key, value)?;

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> eyre::Result<()> {
        self.inner.delete(key)?;

        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> eyre::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();

        let iter = self
            .inner
            .iterator(IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }

        Ok(entries)
    }

    fn apply(&self, tx: Transaction) -> eyre::Result<()> {
        let mut batch = WriteBatch::default();

        for op in tx.ops {
            match op {
                Operation::Put { key, value } => batch.put(key, value),
                Operation::Delete { key } => batch.delete(key),
            }
        }

        self.inner.write(batch)?;

        Ok(())
    }
}
