use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::StoreConfig;
use crate::db::Database;
use crate::tx::{Operation, Transaction};

/// In-memory backend over a `BTreeMap`, naturally ordered by key bytes.
#[derive(Default)]
pub struct InMemoryDb {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> eyre::Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.inner
            .read()
            .map_err(|_| eyre::eyre!("failed to acquire read lock on db"))
    }

    fn write(&self) -> eyre::Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.inner
            .write()
            .map_err(|_| eyre::eyre!("failed to acquire write lock on db"))
    }
}

impl Database for InMemoryDb {
    fn open(_config: &StoreConfig) -> eyre::Result<Self> {
        Ok(Self::default())
    }

    fn get(&self, key: &[u8]) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> eyre::Result<()> {
        let _prev = self.write()?.insert(key.to_vec(), value.to_vec());

        Ok(())
    }

    fn delete(&self, key: &[u8]) -> eyre::Result<()> {
        let _prev = self.write()?.remove(key);

        Ok(())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> eyre::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.read()?;

        let entries = db
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(entries)
    }

    fn apply(&self, tx: Transaction) -> eyre::Result<()> {
        let mut db = self.write()?;

        for op in tx.ops {
            match op {
                Operation::Put { key, value } => {
                    let _prev = db.insert(key, value);
                }
                Operation::Delete { key } => {
                    let _prev = db.remove(&key);
                }
            }
        }

        Ok(())
    }
}
