//! Per-transaction locks.
//!
//! Updates to the same transaction serialize on one mutex while different
//! transactions proceed in parallel. Entries exist only while someone holds
//! or waits for them: interest is counted under the registry mutex both
//! when a caller arrives and when it leaves, so an entry is never evicted
//! out from under a waiter.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tracing::debug;

use crate::models::transaction::TxId;

static GLOBAL: LazyLock<TxLockRegistry> = LazyLock::new(TxLockRegistry::new);

/// The process-wide registry.
pub fn global() -> &'static TxLockRegistry {
    &GLOBAL
}

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    interested: usize,
}

#[derive(Default)]
pub struct TxLockRegistry {
    entries: Mutex<HashMap<TxId, LockEntry>>,
}

impl TxLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock for `id` is ours.
    pub fn acquire(&self, id: TxId) -> TxLockHandle<'_> {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(id).or_insert_with(|| LockEntry {
                mutex: Arc::new(Mutex::new(())),
                interested: 0,
            });
            entry.interested += 1;
            Arc::clone(&entry.mutex)
        };
        let guard = mutex.lock_arc();
        TxLockHandle {
            registry: self,
            id,
            guard: Some(guard),
        }
    }

    /// Number of transactions currently locked or waited on.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, id: TxId) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return;
        };
        entry.interested = entry.interested.saturating_sub(1);
        if entry.interested == 0 {
            entries.remove(&id);
            debug!("Evicted lock for transaction {}", id);
        }
    }
}

/// Proof of holding one transaction's lock. Dropping it unlocks.
pub struct TxLockHandle<'a> {
    registry: &'a TxLockRegistry,
    id: TxId,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl TxLockHandle<'_> {
    pub fn id(&self) -> TxId {
        self.id
    }
}

impl Drop for TxLockHandle<'_> {
    fn drop(&mut self) {
        // Unlock before giving up interest so the next waiter can proceed.
        drop(self.guard.take());
        self.registry.release(self.id);
    }
}

impl std::fmt::Debug for TxLockHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxLockHandle").field("id", &self.id).finish()
    }
}
