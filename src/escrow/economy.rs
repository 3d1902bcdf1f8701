//! Economy and inventory collaborators
//!
//! Amounts are integer minor units. The host server's economy plugin sits
//! behind [`Economy`]; player inventories behind [`Inventory`].

use crate::model::{Actor, ItemStack};
use std::collections::HashMap;
use std::sync::RwLock;

/// Currency provider used to collect money prices
pub trait Economy: Send + Sync {
    fn balance(&self, actor: &Actor) -> i64;

    fn has(&self, actor: &Actor, amount: i64) -> bool {
        self.balance(actor) >= amount
    }

    /// Take money from an account; false if refused
    fn withdraw(&self, actor: &Actor, amount: i64) -> bool;

    /// Give money to an account; false if refused
    fn deposit(&self, actor: &Actor, amount: i64) -> bool;

    /// Force a balance (compensating rollback)
    fn set_balance(&self, actor: &Actor, amount: i64);

    fn format(&self, amount: i64) -> String;
}

/// Item storage of an actor, used to collect item prices
pub trait Inventory: Send + Sync {
    /// How many of an item kind the actor holds
    fn count(&self, actor: &Actor, item: &str) -> u64;

    /// Remove items; false (and nothing removed) if the actor holds too few
    fn take(&self, actor: &Actor, stack: &ItemStack) -> bool;

    /// Add items; false if they do not fit
    fn give(&self, actor: &Actor, stack: &ItemStack) -> bool;
}

/// In-memory economy
///
/// `deposit_cap` simulates providers that silently cap balances: deposits
/// report success but the balance never exceeds the cap.
#[derive(Debug, Default)]
pub struct MemoryEconomy {
    balances: RwLock<HashMap<Actor, i64>>,
    deposit_cap: Option<i64>,
    currency: String,
}

impl MemoryEconomy {
    pub fn new() -> Self {
        Self {
            currency: "coins".to_string(),
            ..Default::default()
        }
    }

    pub fn with_deposit_cap(mut self, cap: i64) -> Self {
        self.deposit_cap = Some(cap);
        self
    }

    pub fn with_currency(mut self, name: impl Into<String>) -> Self {
        self.currency = name.into();
        self
    }
}

impl Economy for MemoryEconomy {
    fn balance(&self, actor: &Actor) -> i64 {
        self.balances
            .read()
            .ok()
            .and_then(|b| b.get(actor).copied())
            .unwrap_or(0)
    }

    fn withdraw(&self, actor: &Actor, amount: i64) -> bool {
        if amount < 0 {
            return false;
        }
        let Ok(mut balances) = self.balances.write() else {
            return false;
        };
        let balance = balances.entry(actor.clone()).or_insert(0);
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        true
    }

    fn deposit(&self, actor: &Actor, amount: i64) -> bool {
        if amount < 0 {
            return false;
        }
        let Ok(mut balances) = self.balances.write() else {
            return false;
        };
        let balance = balances.entry(actor.clone()).or_insert(0);
        let target = balance.saturating_add(amount);
        *balance = match self.deposit_cap {
            Some(cap) => target.min(cap.max(*balance)),
            None => target,
        };
        true
    }

    fn set_balance(&self, actor: &Actor, amount: i64) {
        if let Ok(mut balances) = self.balances.write() {
            balances.insert(actor.clone(), amount);
        }
    }

    fn format(&self, amount: i64) -> String {
        format!("{} {}", amount, self.currency)
    }
}

/// In-memory inventories with a per-actor capacity in items
#[derive(Debug, Default)]
pub struct MemoryInventory {
    items: RwLock<HashMap<Actor, HashMap<String, u64>>>,
    capacity: Option<u64>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn total(&self, actor: &Actor) -> u64 {
        self.items
            .read()
            .ok()
            .and_then(|items| items.get(actor).map(|m| m.values().sum()))
            .unwrap_or(0)
    }
}

impl Inventory for MemoryInventory {
    fn count(&self, actor: &Actor, item: &str) -> u64 {
        self.items
            .read()
            .ok()
            .and_then(|items| items.get(actor).and_then(|m| m.get(item).copied()))
            .unwrap_or(0)
    }

    fn take(&self, actor: &Actor, stack: &ItemStack) -> bool {
        let Ok(mut items) = self.items.write() else {
            return false;
        };
        let Some(held) = items.get_mut(actor).and_then(|m| m.get_mut(&stack.item)) else {
            return false;
        };
        let amount = u64::from(stack.amount);
        if *held < amount {
            return false;
        }
        *held -= amount;
        true
    }

    fn give(&self, actor: &Actor, stack: &ItemStack) -> bool {
        let amount = u64::from(stack.amount);
        if let Some(capacity) = self.capacity {
            if self.total(actor) + amount > capacity {
                return false;
            }
        }
        let Ok(mut items) = self.items.write() else {
            return false;
        };
        *items
            .entry(actor.clone())
            .or_default()
            .entry(stack.item.clone())
            .or_insert(0) += amount;
        true
    }
}
