use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

const NO_FAILURE: usize = usize::MAX;

/// In-process store backed by a sorted map.
///
/// Batches can be made to fail on demand, which lets callers exercise their
/// handling of disk errors without touching the filesystem.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
    batches_until_failure: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            batches_until_failure: AtomicUsize::new(NO_FAILURE),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// After `successes` more batches commit, every following batch fails
    /// without applying any of its operations.
    pub fn fail_batches_after(&self, successes: usize) {
        self.batches_until_failure
            .store(successes, Ordering::SeqCst);
    }

    pub fn clear_failure(&self) {
        self.batches_until_failure.store(NO_FAILURE, Ordering::SeqCst);
    }

    pub fn len(&self, column: Column) -> Result<usize, StoreError> {
        Ok(self.read()?.keys().filter(|(c, _)| *c == column).count())
    }

    /// Copy of every entry in `column`, sorted by key.
    pub fn dump(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .read()?
            .iter()
            .filter(|((c, _), _)| *c == column)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn take_failure(&self) -> bool {
        let remaining = self.batches_until_failure.load(Ordering::SeqCst);
        if remaining == NO_FAILURE {
            return false;
        }
        if remaining == 0 {
            return true;
        }
        self.batches_until_failure
            .store(remaining - 1, Ordering::SeqCst);
        false
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read()?.get(&(column, key.to_vec())).cloned())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        let start = (column, prefix.to_vec());
        for ((entry_column, key), value) in guard.range(start..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if self.take_failure() {
            return Err(StoreError::Backend(
                "injected write failure".to_string(),
            ));
        }
        let mut guard = self.write()?;
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
