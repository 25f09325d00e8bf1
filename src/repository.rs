//! Persistence contract for fetched orders and their local flags.
//!
//! Upserts replace the remote content of an order but never touch the
//! `printed`, `read` and `notified` flags of a stored copy; those only move
//! through the explicit `mark_*` calls.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::RepositoryError;
use crate::models::OrderRecord;

pub trait OrderRepository: Send + Sync {
    /// Insert or update each order, keeping the stored flags. Returns how many
    /// rows were written.
    fn upsert_orders(&self, orders: &[OrderRecord]) -> Result<usize, RepositoryError>;

    fn get(&self, id: i64) -> Result<Option<OrderRecord>, RepositoryError>;

    fn mark_printed(&self, id: i64) -> Result<(), RepositoryError>;

    fn mark_read(&self, id: i64) -> Result<(), RepositoryError>;

    fn mark_unread(&self, id: i64) -> Result<(), RepositoryError>;

    fn mark_notified(&self, id: i64) -> Result<(), RepositoryError>;

    fn get_unread(&self) -> Result<Vec<OrderRecord>, RepositoryError>;

    fn list_by_status(&self, status: &str) -> Result<Vec<OrderRecord>, RepositoryError>;
}

/// In-process repository, ordered by id.
#[derive(Debug, Default)]
pub struct MemoryOrderRepository {
    orders: Mutex<BTreeMap<i64, OrderRecord>>,
}

impl MemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_orders<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<i64, OrderRecord>) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut orders = self.orders.lock().map_err(|_| RepositoryError::Poisoned)?;
        f(&mut orders)
    }

    fn update(&self, id: i64, f: impl FnOnce(&mut OrderRecord)) -> Result<(), RepositoryError> {
        self.with_orders(|orders| {
            let order = orders.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
            f(order);
            Ok(())
        })
    }
}

impl OrderRepository for MemoryOrderRepository {
    fn upsert_orders(&self, incoming: &[OrderRecord]) -> Result<usize, RepositoryError> {
        self.with_orders(|orders| {
            for order in incoming {
                let mut record = order.clone();
                if let Some(stored) = orders.get(&order.id) {
                    record.printed = stored.printed;
                    record.read = stored.read;
                    record.notified = stored.notified;
                }
                orders.insert(record.id, record);
            }
            Ok(incoming.len())
        })
    }

    fn get(&self, id: i64) -> Result<Option<OrderRecord>, RepositoryError> {
        self.with_orders(|orders| Ok(orders.get(&id).cloned()))
    }

    fn mark_printed(&self, id: i64) -> Result<(), RepositoryError> {
        self.update(id, |o| o.printed = true)
    }

    fn mark_read(&self, id: i64) -> Result<(), RepositoryError> {
        self.update(id, |o| o.read = true)
    }

    fn mark_unread(&self, id: i64) -> Result<(), RepositoryError> {
        self.update(id, |o| o.read = false)
    }

    fn mark_notified(&self, id: i64) -> Result<(), RepositoryError> {
        self.update(id, |o| o.notified = true)
    }

    fn get_unread(&self) -> Result<Vec<OrderRecord>, RepositoryError> {
        self.with_orders(|orders| Ok(orders.values().filter(|o| !o.read).cloned().collect()))
    }

    fn list_by_status(&self, status: &str) -> Result<Vec<OrderRecord>, RepositoryError> {
        self.with_orders(|orders| {
            Ok(orders
                .values()
                .filter(|o| o.status.eq_ignore_ascii_case(status))
                .cloned()
                .collect())
        })
    }
}
