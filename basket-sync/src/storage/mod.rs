//! Persistent storage layer for the shopping list.
//!
//! Architecture:
//! ```text
//! ┌─────────────────┐   ItemBatch (atomic)   ┌──────────────────────┐
//! │ MutationService │ ─────────────────────► │ ItemStore            │
//! │ (write gate)    │                        │  ├─ MemoryItemStore  │
//! └─────────────────┘ ◄───────────────────── │  └─ RocksItemStore   │
//!                        load_all / find      └──────────────────────┘
//! ```
//!
//! A store only has to guarantee that one `commit` is all-or-nothing.
//! Serializing read-modify-write sequences is the service's job.

pub mod memory;
pub mod rocks;

pub use memory::MemoryItemStore;
pub use rocks::{RocksItemStore, StoreConfig};

use crate::item::{Item, ItemId};

/// One atomic unit of change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemBatch {
    /// Items to insert or overwrite
    pub puts: Vec<Item>,
    /// Item ids to remove
    pub deletes: Vec<ItemId>,
    /// New value of the id counter, when ids were allocated
    pub next_id: Option<ItemId>,
}

impl ItemBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, item: Item) -> Self {
        self.puts.push(item);
        self
    }

    pub fn delete(mut self, id: ItemId) -> Self {
        self.deletes.push(id);
        self
    }

    pub fn advance_id(mut self, next_id: ItemId) -> Self {
        self.next_id = Some(next_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty() && self.next_id.is_none()
    }
}

/// Transactional key-indexed record store for items.
pub trait ItemStore: Send + Sync {
    /// Every stored item, in no particular order.
    fn load_all(&self) -> Result<Vec<Item>, StoreError>;

    fn find(&self, id: ItemId) -> Result<Option<Item>, StoreError>;

    /// Id the next created item will receive (not reserved until committed).
    fn next_id(&self) -> Result<ItemId, StoreError>;

    /// Apply all puts, deletes and the counter advance, or none of them.
    fn commit(&self, batch: ItemBatch) -> Result<(), StoreError>;

    /// Checked items, for bulk removal.
    fn checked_items(&self) -> Result<Vec<Item>, StoreError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(Item::is_checked)
            .collect())
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Store state poisoned by a panic mid-write
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Poisoned => write!(f, "Store lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder() {
        let batch = ItemBatch::new()
            .put(Item::new(1, "Milk", "1L", 1))
            .delete(2)
            .advance_id(3);

        assert_eq!(batch.puts.len(), 1);
        assert_eq!(batch.deletes, vec![2]);
        assert_eq!(batch.next_id, Some(3));
        assert!(!batch.is_empty());
        assert!(ItemBatch::new().is_empty());
    }
}
