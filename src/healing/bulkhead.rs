//! Bulkheads: bounded slot pools isolating failure blast radius.
//!
//! Operations acquire a slot from a named pool or are rejected with
//! `BulkheadFull`; slots are released unconditionally when the permit drops,
//! so a panicking or cancelled operation can never leak capacity.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::{EngineError, EngineResult};

const DEFAULT_SLOTS: usize = 10;

/// A held bulkhead slot. Dropping it releases the slot.
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Keyed collection of bounded slot pools.
pub struct BulkheadRegistry {
    pools: DashMap<String, Arc<Semaphore>>,
    default_slots: usize,
}

impl Default for BulkheadRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

impl BulkheadRegistry {
    /// A registry whose pools default to the given slot count.
    pub fn new(default_slots: usize) -> Self {
        Self {
            pools: DashMap::new(),
            default_slots: default_slots.max(1),
        }
    }

    /// Size a named pool explicitly. Replaces the pool; outstanding permits
    /// against the old pool stay valid until dropped.
    pub fn configure(&self, pool: impl Into<String>, slots: usize) {
        self.pools
            .insert(pool.into(), Arc::new(Semaphore::new(slots.max(1))));
    }

    fn pool(&self, pool: &str) -> Arc<Semaphore> {
        self.pools
            .entry(pool.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.default_slots)))
            .clone()
    }

    /// Take a slot from the pool, or fail immediately with `BulkheadFull`.
    pub fn try_acquire(&self, pool: &str) -> EngineResult<BulkheadPermit> {
        match self.pool(pool).try_acquire_owned() {
            Ok(permit) => Ok(BulkheadPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(EngineError::BulkheadFull {
                    pool: pool.to_string(),
                })
            }
        }
    }

    /// Free slots currently available in a pool.
    pub fn available(&self, pool: &str) -> usize {
        self.pool(pool).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let bulkheads = BulkheadRegistry::new(2);
        let first = bulkheads.try_acquire("database").unwrap();
        let _second = bulkheads.try_acquire("database").unwrap();
        assert!(matches!(
            bulkheads.try_acquire("database"),
            Err(EngineError::BulkheadFull { .. })
        ));

        drop(first);
        // The slot came back unconditionally.
        assert_eq!(bulkheads.available("database"), 1);
        bulkheads.try_acquire("database").unwrap();
    }

    #[test]
    fn test_pools_are_independent() {
        let bulkheads = BulkheadRegistry::new(1);
        let _db = bulkheads.try_acquire("database").unwrap();
        assert!(bulkheads.try_acquire("database").is_err());
        // A different pool still has capacity.
        bulkheads.try_acquire("network").unwrap();
    }

    #[test]
    fn test_configured_pool_size() {
        let bulkheads = BulkheadRegistry::new(10);
        bulkheads.configure("tiny", 1);
        let _held = bulkheads.try_acquire("tiny").unwrap();
        assert!(bulkheads.try_acquire("tiny").is_err());
    }
}
