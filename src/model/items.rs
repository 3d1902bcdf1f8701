//! Item stacks carried as mail attachments

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default number of items a single stack may hold
pub const DEFAULT_MAX_STACK: u32 = 64;

/// A typed stack of items
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemStack {
    /// Item type identifier (e.g. `minecraft:diamond`)
    pub item: String,

    /// Number of items in the stack
    pub amount: u32,
}

impl ItemStack {
    pub fn new(item: impl Into<String>, amount: u32) -> Self {
        Self {
            item: item.into(),
            amount,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.amount == 0 || self.item.is_empty()
    }

    /// Whether two stacks hold the same kind of item
    pub fn same_kind(&self, other: &ItemStack) -> bool {
        self.item == other.item
    }
}

impl fmt::Display for ItemStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x{}", self.item, self.amount)
    }
}

/// Merge stacks of the same kind and drop empty ones
///
/// Kinds keep the order in which they first appear. Each kind is re-split into
/// stacks of at most `max_stack` items, so the total amount per kind never
/// changes.
pub fn compact(stacks: impl IntoIterator<Item = ItemStack>, max_stack: u32) -> Vec<ItemStack> {
    let max_stack = max_stack.max(1);
    let mut totals: Vec<(String, u64)> = Vec::new();

    for stack in stacks {
        if stack.is_empty() {
            continue;
        }
        match totals.iter_mut().find(|(item, _)| *item == stack.item) {
            Some((_, total)) => *total += u64::from(stack.amount),
            None => totals.push((stack.item, u64::from(stack.amount))),
        }
    }

    let mut out = Vec::new();
    for (item, mut total) in totals {
        while total > 0 {
            let take = total.min(u64::from(max_stack));
            out.push(ItemStack::new(item.clone(), take as u32));
            total -= take;
        }
    }
    out
}

/// Total number of individual items across all stacks
pub fn total_count(stacks: &[ItemStack]) -> u64 {
    stacks.iter().map(|s| u64::from(s.amount)).sum()
}

/// Number of items of one kind across all stacks
pub fn count_of(stacks: &[ItemStack], item: &str) -> u64 {
    stacks
        .iter()
        .filter(|s| s.item == item)
        .map(|s| u64::from(s.amount))
        .sum()
}
