use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("memory store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert(
                        (*column, key.as_slice().to_vec()),
                        value.as_slice().to_vec(),
                    );
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.as_slice().to_vec()));
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
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, [1u8; 32], vec![1, 2, 3]);
        batch.put(Column::Meta, b"best".as_slice(), [9u8; 32]);
        store.write_batch(&batch).unwrap();

        assert_eq!(
            store.get(Column::BlockIndex, &[1u8; 32]).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(
            store.get(Column::Meta, b"best").unwrap(),
            Some([9u8; 32].to_vec())
        );

        let mut batch = WriteBatch::new();
        batch.delete(Column::BlockIndex, [1u8; 32]);
        store.write_batch(&batch).unwrap();
        assert_eq!(store.get(Column::BlockIndex, &[1u8; 32]).unwrap(), None);
    }

    #[test]
    fn scan_prefix_is_column_scoped() {
        let store = MemoryStore::new();
        store.put(Column::BlockIndex, &[1u8; 32], b"a").unwrap();
        store.put(Column::Meta, &[1u8; 32], b"b").unwrap();

        let rows = store.scan_prefix(Column::BlockIndex, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, b"a".to_vec());
    }
}
