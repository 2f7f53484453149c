//! Shopping list item model and display ordering.
//!
//! Ordering rules for a list read:
//! ```text
//! ┌───────────────────────────────┬──────────────────────────────────┐
//! │ unchecked (checked_at = None) │ checked (checked_at = Some(t))   │
//! │ sort_order ascending          │ checked_at descending (newest 1st)│
//! └───────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Checked items older than the retention window are hidden from reads but
//! stay in storage until `DeleteAllCheckedItems` removes them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Server-assigned item identifier. Monotonic, never reused.
pub type ItemId = u64;

/// Days a checked item stays visible in list reads.
pub const RETENTION_DAYS: i64 = 7;

/// One entry on the shared shopping list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Display name, never empty.
    pub name: String,
    /// Free-form quantity ("2 bags", "1L"), kept exactly as entered.
    pub quantity: String,
    /// `None` while the item is active.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub checked_at: Option<DateTime<Utc>>,
    /// Position among unchecked items. Not load-bearing once checked.
    pub sort_order: i64,
}

impl Item {
    pub fn new(
        id: ItemId,
        name: impl Into<String>,
        quantity: impl Into<String>,
        sort_order: i64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            quantity: quantity.into(),
            checked_at: None,
            sort_order,
        }
    }

    pub fn is_checked(&self) -> bool {
        self.checked_at.is_some()
    }

    /// Whether a list read at `now` should include this item.
    pub fn is_visible_at(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.checked_at {
            None => true,
            Some(at) => at > now - retention,
        }
    }
}

/// Default retention window as a chrono duration.
pub fn retention_window() -> Duration {
    Duration::days(RETENTION_DAYS)
}

/// Display ordering: unchecked by sort order, then checked newest first.
///
/// Ties fall back to the id so the order is total.
pub fn display_order(a: &Item, b: &Item) -> Ordering {
    match (a.checked_at, b.checked_at) {
        (None, None) => a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x).then(a.id.cmp(&b.id)),
    }
}

/// Filter out expired checked items and sort the rest for display.
pub fn arrange(items: Vec<Item>, now: DateTime<Utc>, retention: Duration) -> Vec<Item> {
    let mut visible: Vec<Item> = items
        .into_iter()
        .filter(|i| i.is_visible_at(now, retention))
        .collect();
    visible.sort_by(display_order);
    visible
}

/// Next free slot at the bottom of the unchecked partition.
///
/// `exclude` skips one item (the one being moved), so unchecking an item
/// never counts its own stale sort order.
pub fn next_sort_order<'a, I>(items: I, exclude: Option<ItemId>) -> i64
where
    I: IntoIterator<Item = &'a Item>,
{
    items
        .into_iter()
        .filter(|i| !i.is_checked() && Some(i.id) != exclude)
        .map(|i| i.sort_order)
        .max()
        .map_or(1, |max| max + 1)
}
