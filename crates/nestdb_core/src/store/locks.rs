//! Per-document exclusion for update and remove.

use nestdb_codec::Value;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<BTreeMap<Value, Arc<AsyncMutex<()>>>>>;

/// Lock table keyed by `_id`.
///
/// Slots are created on demand and dropped with their last guard.
#[derive(Debug, Default)]
pub(crate) struct DocumentLocks {
    slots: Slots,
}

/// Holds one document's lock until dropped.
#[derive(Debug)]
pub(crate) struct DocumentGuard {
    id: Value,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl Drop for DocumentGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock();
        // Only the table still references the slot: nobody holds or awaits it.
        if slots
            .get(&self.id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.id);
        }
    }
}

impl DocumentLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to the document `id`.
    pub(crate) async fn acquire(&self, id: Value) -> DocumentGuard {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(id.clone()).or_default())
        };
        let guard = slot.lock_owned().await;
        DocumentGuard {
            id,
            guard: Some(guard),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Locks several documents, in `_id` order so that two callers with
    /// overlapping sets cannot deadlock.
    pub(crate) async fn acquire_many<I>(&self, ids: I) -> Vec<DocumentGuard>
    where
        I: IntoIterator<Item = Value>,
    {
        let ordered: BTreeSet<Value> = ids.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            guards.push(self.acquire(id).await);
        }
        guards
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }
}
