//! The in-memory driver: ordered maps behind a read/write lock.
//!
//! Read transactions hold the lock shared for their lifetime, which gives
//! them a consistent view; the single writer batches its mutations and
//! applies them on commit.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard};

use super::{KvStore, ReadTx, StorageError, Table, WriteTx};

type TableMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// A [`KvStore`] backed by per-table `BTreeMap`s.
#[derive(Debug, Default)]
pub struct MemoryKv {
    tables: RwLock<[TableMap; Table::ALL.len()]>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }
}

impl KvStore for MemoryKv {
    fn read(&self) -> Result<Box<dyn ReadTx + '_>, StorageError> {
        let guard = self
            .tables
            .read()
            .map_err(|_| StorageError::Driver("poisoned lock".into()))?;
        Ok(Box::new(MemoryReadTx { guard }))
    }

    fn write(&self) -> Result<Box<dyn WriteTx + '_>, StorageError> {
        Ok(Box::new(MemoryWriteTx {
            store: self,
            // Pending mutations; `None` marks a delete.
            pending: Default::default(),
        }))
    }
}

struct MemoryReadTx<'a> {
    guard: RwLockReadGuard<'a, [TableMap; Table::ALL.len()]>,
}

impl ReadTx for MemoryReadTx<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.guard[table.index()].get(key).cloned())
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        Ok(scan_map(&self.guard[table.index()], prefix))
    }
}

fn scan_map(map: &TableMap, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range(prefix.to_vec()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

struct MemoryWriteTx<'a> {
    store: &'a MemoryKv,
    pending: [BTreeMap<Vec<u8>, Option<Vec<u8>>>; Table::ALL.len()],
}

impl ReadTx for MemoryWriteTx<'_> {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(pending) = self.pending[table.index()].get(key) {
            return Ok(pending.clone());
        }
        let guard = self
            .store
            .tables
            .read()
            .map_err(|_| StorageError::Driver("poisoned lock".into()))?;
        Ok(guard[table.index()].get(key).cloned())
    }

    fn scan_prefix(
        &self,
        table: Table,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let guard = self
            .store
            .tables
            .read()
            .map_err(|_| StorageError::Driver("poisoned lock".into()))?;
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            scan_map(&guard[table.index()], prefix).into_iter().collect();
        for (key, value) in self.pending[table.index()]
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
        {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

impl WriteTx for MemoryWriteTx<'_> {
    fn put(&mut self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.pending[table.index()].insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, table: Table, key: &[u8]) -> Result<(), StorageError> {
        self.pending[table.index()].insert(key.to_vec(), None);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut guard = self
            .store
            .tables
            .write()
            .map_err(|_| StorageError::Driver("poisoned lock".into()))?;
        for (index, pending) in self.pending.into_iter().enumerate() {
            for (key, value) in pending {
                match value {
                    Some(value) => {
                        guard[index].insert(key, value);
                    }
                    None => {
                        guard[index].remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_writes_are_invisible() {
        let kv = MemoryKv::new();
        let mut w = kv.write().unwrap();
        w.put(Table::Sdbi, b"k", b"v").unwrap();
        assert_eq!(w.get(Table::Sdbi, b"k").unwrap(), Some(b"v".to_vec()));
        drop(w);
        assert_eq!(kv.read().unwrap().get(Table::Sdbi, b"k").unwrap(), None);
    }

    #[test]
    fn prefix_scan_merges_pending_deletes() {
        let kv = MemoryKv::new();
        let mut w = kv.write().unwrap();
        w.put(Table::History, b"aa1", b"1").unwrap();
        w.put(Table::History, b"aa2", b"2").unwrap();
        w.put(Table::History, b"ab1", b"3").unwrap();
        w.commit().unwrap();

        let mut w = kv.write().unwrap();
        w.delete(Table::History, b"aa2").unwrap();
        w.put(Table::History, b"aa3", b"4").unwrap();
        let scanned = w.scan_prefix(Table::History, b"aa").unwrap();
        let keys: Vec<_> = scanned.iter().map(|(key, _)| key.as_slice()).collect();
        assert_eq!(keys, [b"aa1".as_slice(), b"aa3".as_slice()]);
    }
}
