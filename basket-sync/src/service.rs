//! Mutation service: validates and applies list operations.
//!
//! Every write runs as one closure on the blocking pool while holding the
//! write gate:
//! ```text
//! call ──► validate input ──► gate.lock() ──► read store ──► build ItemBatch
//!                                                │
//!                                                ▼
//!                                       store.commit(batch)  (all-or-nothing)
//! ```
//! Reading max(sort_order) and committing the new value therefore never
//! interleave with another mutation. Once started, a write runs to
//! completion even if the caller stops waiting for it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::item::{self, Item, ItemId};
use crate::protocol::{ErrorCode, HubError};
use crate::storage::{ItemBatch, ItemStore, StoreError};

/// Source of "now" for check timestamps and the retention cutoff.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Business-level failure of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    NotFound(ItemId),
    InvalidInput(String),
    Storage(StoreError),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::Storage(_) => ErrorCode::OperationFailed,
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Item {id} not found"),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            Self::Storage(e) => write!(f, "Storage failure: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

impl From<ServiceError> for HubError {
    fn from(e: ServiceError) -> Self {
        HubError::new(e.code(), e.to_string())
    }
}

/// Authoritative shopping list operations.
#[derive(Clone)]
pub struct MutationService {
    store: Arc<dyn ItemStore>,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write sequences against the store
    write_gate: Arc<Mutex<()>>,
    retention: Duration,
}

impl MutationService {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn ItemStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_gate: Arc::new(Mutex::new(())),
            retention: item::retention_window(),
        }
    }

    /// Override the checked-item retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn store(&self) -> &Arc<dyn ItemStore> {
        &self.store
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Active items: unchecked by sort order, then recently checked items
    /// newest first. Expired checked items are hidden, not deleted.
    pub async fn get_all_items(&self) -> Result<Vec<Item>, ServiceError> {
        let store = self.store.clone();
        let now = self.clock.now();
        let retention = self.retention;
        run_blocking(move || {
            let items = store.load_all()?;
            Ok(item::arrange(items, now, retention))
        })
        .await
    }

    // ─── Writes ───────────────────────────────────────────────────────

    pub async fn add_item(&self, name: &str, quantity: &str) -> Result<Item, ServiceError> {
        let name = validate_name(name)?;
        let quantity = quantity.trim().to_string();

        self.write(move |store, _| {
            let id = store.next_id()?;
            let sort_order = item::next_sort_order(&store.load_all()?, None);
            let item = Item::new(id, name, quantity, sort_order);
            store.commit(ItemBatch::new().put(item.clone()).advance_id(id + 1))?;
            log::debug!("Added item {id} at sort order {sort_order}");
            Ok(item)
        })
        .await
    }

    /// Mark an item checked now. Its sort order is left as is.
    pub async fn check_item(&self, id: ItemId) -> Result<Item, ServiceError> {
        self.write(move |store, now| {
            let mut item = store.find(id)?.ok_or(ServiceError::NotFound(id))?;
            item.checked_at = Some(now);
            store.commit(ItemBatch::new().put(item.clone()))?;
            Ok(item)
        })
        .await
    }

    /// Return an item to the active list, at the bottom.
    pub async fn uncheck_item(&self, id: ItemId) -> Result<Item, ServiceError> {
        self.write(move |store, _| {
            let mut item = store.find(id)?.ok_or(ServiceError::NotFound(id))?;
            item.checked_at = None;
            item.sort_order = item::next_sort_order(&store.load_all()?, Some(id));
            store.commit(ItemBatch::new().put(item.clone()))?;
            Ok(item)
        })
        .await
    }

    /// Overwrite name and quantity; sort order and check state are kept.
    pub async fn update_item(
        &self,
        id: ItemId,
        name: &str,
        quantity: &str,
    ) -> Result<Item, ServiceError> {
        let name = validate_name(name)?;
        let quantity = quantity.trim().to_string();

        self.write(move |store, _| {
            let mut item = store.find(id)?.ok_or(ServiceError::NotFound(id))?;
            item.name = name;
            item.quantity = quantity;
            store.commit(ItemBatch::new().put(item.clone()))?;
            Ok(item)
        })
        .await
    }

    pub async fn delete_item(&self, id: ItemId) -> Result<(), ServiceError> {
        self.write(move |store, _| {
            store.find(id)?.ok_or(ServiceError::NotFound(id))?;
            store.commit(ItemBatch::new().delete(id))?;
            Ok(())
        })
        .await
    }

    /// Remove every checked item, including ones hidden by retention.
    /// Returns how many were removed.
    pub async fn delete_all_checked_items(&self) -> Result<usize, ServiceError> {
        self.write(move |store, _| {
            let checked = store.checked_items()?;
            if checked.is_empty() {
                return Ok(0);
            }
            let batch = checked
                .iter()
                .fold(ItemBatch::new(), |batch, item| batch.delete(item.id));
            store.commit(batch)?;
            Ok(checked.len())
        })
        .await
    }

    /// Assign `sort_order = position + 1` to the given unchecked items.
    ///
    /// Items not named keep their sort order unless it now collides with a
    /// reassigned slot; colliding items move after the largest sort order,
    /// in their previous relative order.
    pub async fn reorder_items(&self, ordered_ids: &[ItemId]) -> Result<(), ServiceError> {
        if ordered_ids.is_empty() {
            return Err(ServiceError::InvalidInput("Reorder list is empty".into()));
        }
        let mut seen = HashSet::with_capacity(ordered_ids.len());
        if let Some(dup) = ordered_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(ServiceError::InvalidInput(format!(
                "Item {dup} appears more than once"
            )));
        }
        let ordered_ids = ordered_ids.to_vec();

        self.write(move |store, _| {
            let items = store.load_all()?;
            let batch = plan_reorder(&items, &ordered_ids)?;
            store.commit(batch)?;
            Ok(())
        })
        .await
    }

    /// Run one read-modify-write sequence under the write gate.
    async fn write<T, F>(&self, op: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ItemStore, DateTime<Utc>) -> Result<T, ServiceError> + Send + 'static,
    {
        let store = self.store.clone();
        let gate = self.write_gate.clone();
        let clock = self.clock.clone();
        run_blocking(move || {
            let _guard = gate.lock().map_err(|_| StoreError::Poisoned)?;
            op(store.as_ref(), clock.now())
        })
        .await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        log::error!("Storage task failed: {e}");
        ServiceError::Storage(StoreError::DatabaseError(e.to_string()))
    })?
}

fn validate_name(name: &str) -> Result<String, ServiceError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidInput("Item name must not be empty".into()));
    }
    Ok(trimmed.to_string())
}

/// Compute the batch for a reorder, or reject it without side effects.
///
/// Listed ids take sort orders `1..=n` in the given order. Unlisted
/// unchecked items normally keep their sort order, but one that sits in
/// `1..=n` would collide with a listed item, so it is moved past the
/// current maximum instead. Unique unchecked sort orders win over leaving
/// every unlisted item in place.
fn plan_reorder(items: &[Item], ordered_ids: &[ItemId]) -> Result<ItemBatch, ServiceError> {
    let mut reordered = Vec::with_capacity(ordered_ids.len());
    for id in ordered_ids {
        let item = items
            .iter()
            .find(|i| i.id == *id)
            .ok_or(ServiceError::NotFound(*id))?;
        reordered.push(item);
    }
    if let Some(checked) = reordered.iter().find(|i| i.is_checked()) {
        return Err(ServiceError::InvalidInput(format!(
            "Item {} is checked and cannot be reordered",
            checked.id
        )));
    }

    let mut batch = ItemBatch::new();
    for (pos, item) in reordered.iter().enumerate() {
        let sort_order = pos as i64 + 1;
        if item.sort_order != sort_order {
            let mut moved = (*item).clone();
            moved.sort_order = sort_order;
            batch = batch.put(moved);
        }
    }

    // Untouched unchecked items that now share a slot with a reordered one.
    let taken = ordered_ids.len() as i64;
    let mut bystanders: Vec<&Item> = items
        .iter()
        .filter(|i| !i.is_checked() && !ordered_ids.contains(&i.id))
        .collect();
    bystanders.sort_by(|a, b| item::display_order(a, b));
    let mut next = bystanders
        .iter()
        .map(|i| i.sort_order)
        .max()
        .unwrap_or(0)
        .max(taken)
        + 1;
    for bystander in bystanders {
        if (1..=taken).contains(&bystander.sort_order) {
            let mut moved = bystander.clone();
            moved.sort_order = next;
            next += 1;
            batch = batch.put(moved);
        }
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryItemStore;
    use std::sync::Mutex as StdMutex;

    /// Clock that only moves when told to.
    pub(crate) struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Utc::now())))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn service() -> (MutationService, Arc<ManualClock>) {
        let clock = ManualClock::new();
        let svc = MutationService::with_clock(Arc::new(MemoryItemStore::new()), clock.clone());
        (svc, clock)
    }

    fn names(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_add_assigns_increasing_sort_order() {
        let (svc, _) = service();
        let mut last = 0;
        for n in 0..10 {
            let item = svc.add_item(&format!("item{n}"), "1").await.unwrap();
            assert!(item.sort_order > last);
            last = item.sort_order;
        }
        let items = svc.get_all_items().await.unwrap();
        let orders: HashSet<i64> = items.iter().map(|i| i.sort_order).collect();
        assert_eq!(orders.len(), 10);
    }

    #[tokio::test]
    async fn test_add_rejects_blank_name() {
        let (svc, _) = service();
        let err = svc.add_item("   ", "1").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert!(svc.get_all_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_after_delete() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        svc.delete_item(a.id).await.unwrap();
        let b = svc.add_item("B", "1").await.unwrap();
        assert!(b.id > a.id);
        assert_eq!(b.sort_order, 1);
    }

    #[tokio::test]
    async fn test_milk_bread_scenario() {
        let (svc, clock) = service();
        let milk = svc.add_item("Milk", "1L").await.unwrap();
        let bread = svc.add_item("Bread", "2").await.unwrap();
        assert_eq!((milk.sort_order, bread.sort_order), (1, 2));
        assert_eq!(names(&svc.get_all_items().await.unwrap()), vec!["Milk", "Bread"]);

        clock.advance(Duration::seconds(1));
        svc.check_item(milk.id).await.unwrap();
        assert_eq!(names(&svc.get_all_items().await.unwrap()), vec!["Bread", "Milk"]);

        let milk = svc.uncheck_item(milk.id).await.unwrap();
        let items = svc.get_all_items().await.unwrap();
        assert_eq!(names(&items), vec!["Bread", "Milk"]);
        assert!(milk.checked_at.is_none());
        assert_eq!(milk.sort_order, 3);
    }

    #[tokio::test]
    async fn test_uncheck_moves_below_all_unchecked() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        for n in 0..4 {
            svc.add_item(&format!("x{n}"), "1").await.unwrap();
        }
        svc.check_item(a.id).await.unwrap();
        let a = svc.uncheck_item(a.id).await.unwrap();

        let items = svc.get_all_items().await.unwrap();
        assert!(items
            .iter()
            .filter(|i| i.id != a.id && !i.is_checked())
            .all(|i| i.sort_order < a.sort_order));
        assert_eq!(items.last().unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_checked_items_newest_first() {
        let (svc, clock) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        let b = svc.add_item("B", "1").await.unwrap();
        svc.check_item(a.id).await.unwrap();
        clock.advance(Duration::minutes(5));
        svc.check_item(b.id).await.unwrap();

        assert_eq!(names(&svc.get_all_items().await.unwrap()), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_retention_hides_but_keeps_old_checked() {
        let (svc, clock) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        svc.add_item("B", "1").await.unwrap();
        svc.check_item(a.id).await.unwrap();

        clock.advance(Duration::days(8));
        assert_eq!(names(&svc.get_all_items().await.unwrap()), vec!["B"]);
        assert!(svc.store().find(a.id).unwrap().is_some());

        // Bulk clear still removes the hidden item.
        assert_eq!(svc.delete_all_checked_items().await.unwrap(), 1);
        assert!(svc.store().find(a.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_found_errors() {
        let (svc, _) = service();
        assert_eq!(svc.check_item(9).await, Err(ServiceError::NotFound(9)));
        assert_eq!(svc.uncheck_item(9).await, Err(ServiceError::NotFound(9)));
        assert_eq!(svc.delete_item(9).await, Err(ServiceError::NotFound(9)));
        assert_eq!(
            svc.update_item(9, "X", "1").await,
            Err(ServiceError::NotFound(9))
        );
    }

    #[tokio::test]
    async fn test_update_keeps_position_and_check_state() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        svc.add_item("B", "1").await.unwrap();
        svc.check_item(a.id).await.unwrap();

        let updated = svc.update_item(a.id, "Apples", "2 bags").await.unwrap();
        assert_eq!(updated.name, "Apples");
        assert_eq!(updated.quantity, "2 bags");
        assert_eq!(updated.sort_order, a.sort_order);
        assert!(updated.is_checked());
    }

    #[tokio::test]
    async fn test_delete_all_checked_noop() {
        let (svc, _) = service();
        svc.add_item("A", "1").await.unwrap();
        let before = svc.get_all_items().await.unwrap();

        assert_eq!(svc.delete_all_checked_items().await.unwrap(), 0);
        assert_eq!(svc.get_all_items().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_reorder_swaps_items() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        let b = svc.add_item("B", "1").await.unwrap();

        svc.reorder_items(&[b.id, a.id]).await.unwrap();
        assert_eq!(names(&svc.get_all_items().await.unwrap()), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn test_reorder_rejects_checked_without_changes() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        let b = svc.add_item("B", "1").await.unwrap();
        svc.check_item(b.id).await.unwrap();
        let before = svc.get_all_items().await.unwrap();

        let err = svc.reorder_items(&[b.id, a.id]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert_eq!(svc.get_all_items().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_reorder_input_errors() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();

        assert_eq!(svc.reorder_items(&[]).await.unwrap_err().code(), ErrorCode::InvalidInput);
        assert_eq!(svc.reorder_items(&[a.id, 77]).await, Err(ServiceError::NotFound(77)));
        assert_eq!(
            svc.reorder_items(&[a.id, a.id]).await.unwrap_err().code(),
            ErrorCode::InvalidInput
        );
    }

    #[tokio::test]
    async fn test_partial_reorder_keeps_sort_orders_unique() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        let b = svc.add_item("B", "1").await.unwrap();
        let c = svc.add_item("C", "1").await.unwrap();
        let d = svc.add_item("D", "1").await.unwrap();

        svc.reorder_items(&[d.id, c.id]).await.unwrap();

        let items = svc.get_all_items().await.unwrap();
        assert_eq!(names(&items), vec!["D", "C", "A", "B"]);
        let orders: HashSet<i64> = items.iter().map(|i| i.sort_order).collect();
        assert_eq!(orders.len(), 4);
        assert!(items.iter().any(|i| i.id == a.id && i.sort_order == 3));
        assert!(items.iter().any(|i| i.id == b.id && i.sort_order == 4));
    }

    #[tokio::test]
    async fn test_partial_reorder_leaves_distant_items() {
        let (svc, _) = service();
        let a = svc.add_item("A", "1").await.unwrap();
        svc.add_item("B", "1").await.unwrap();
        let c = svc.add_item("C", "1").await.unwrap();

        svc.reorder_items(&[a.id]).await.unwrap();
        assert_eq!(svc.store().find(c.id).unwrap().unwrap().sort_order, 3);
    }

    #[tokio::test]
    async fn test_concurrent_adds_get_distinct_sort_orders() {
        let (svc, _) = service();
        let mut handles = Vec::new();
        for n in 0..32 {
            let svc = svc.clone();
            handles.push(tokio::spawn(async move {
                svc.add_item(&format!("item{n}"), "1").await.unwrap()
            }));
        }
        let mut orders = HashSet::new();
        let mut ids = HashSet::new();
        for h in handles {
            let item = h.await.unwrap();
            orders.insert(item.sort_order);
            ids.insert(item.id);
        }
        assert_eq!(orders.len(), 32);
        assert_eq!(ids.len(), 32);
    }

    #[test]
    fn test_service_error_maps_to_hub_error() {
        let hub: HubError = ServiceError::NotFound(4).into();
        assert_eq!(hub.code, ErrorCode::NotFound);
        assert_eq!(hub.message, "Item 4 not found");
    }
}
