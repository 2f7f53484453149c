//! In-memory item store, used when no data directory is configured.

use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{ItemBatch, ItemStore, StoreError};
use crate::item::{Item, ItemId};

struct Inner {
    items: BTreeMap<ItemId, Item>,
    next_id: ItemId,
}

/// Volatile store: the list lives as long as the process.
pub struct MemoryItemStore {
    inner: RwLock<Inner>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                items: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemStore for MemoryItemStore {
    fn load_all(&self) -> Result<Vec<Item>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.items.values().cloned().collect())
    }

    fn find(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.items.get(&id).cloned())
    }

    fn next_id(&self) -> Result<ItemId, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.next_id)
    }

    fn commit(&self, batch: ItemBatch) -> Result<(), StoreError> {
        // Single write lock for the whole batch: readers see all or nothing.
        let mut inner = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        for id in &batch.deletes {
            inner.items.remove(id);
        }
        for item in batch.puts {
            inner.items.insert(item.id, item);
        }
        if let Some(next) = batch.next_id {
            inner.next_id = inner.next_id.max(next);
        }
        Ok(())
    }
}
