//! Per-resource mutual exclusion for allocator operations.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::errors::{AllocationError, AllocationResult};
use crate::models::{LocationId, PalletId, ProductId, StockId};

/// Lockable resource. The derived order is the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKey {
    Product(ProductId),
    Pallet(PalletId),
    Location(LocationId),
    Stock(StockId),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Product(id) => write!(f, "product:{id}"),
            Self::Pallet(id) => write!(f, "pallet:{id}"),
            Self::Location(id) => write!(f, "location:{id}"),
            Self::Stock(id) => write!(f, "stock:{id}"),
        }
    }
}

/// Guards held for the duration of one allocator operation.
///
/// Dropping the lease unlocks every key and forgets the ones nobody else is
/// waiting on, so the table only holds keys that are in use.
pub struct ResourceLease<'a> {
    table: &'a LockTable,
    guards: Vec<(ResourceKey, OwnedMutexGuard<()>)>,
}

impl Drop for ResourceLease<'_> {
    fn drop(&mut self) {
        while let Some((key, guard)) = self.guards.pop() {
            drop(guard);
            self.table.prune(key);
        }
    }
}

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every key in sorted order, giving up after `timeout` per key.
    ///
    /// Sorted acquisition keeps two operations over overlapping resources from
    /// deadlocking; a timeout surfaces as a retryable `ConcurrencyConflict`.
    pub async fn acquire(
        &self,
        keys: impl IntoIterator<Item = ResourceKey>,
        timeout: Duration,
    ) -> AllocationResult<ResourceLease<'_>> {
        let mut keys: Vec<ResourceKey> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let mut lease = ResourceLease {
            table: self,
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            let mutex = Arc::clone(self.locks.entry(key).or_default().value());
            match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => lease.guards.push((key, guard)),
                Err(_) => {
                    self.prune(key);
                    return Err(AllocationError::ConcurrencyConflict {
                        resource: key.to_string(),
                    });
                }
            }
        }

        Ok(lease)
    }

    /// Drop `key` when the table holds the only reference to its mutex.
    fn prune(&self, key: ResourceKey) {
        self.locks.remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
