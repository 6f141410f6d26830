//! Per-address serialization within one process.

use tokio::sync::{Mutex, MutexGuard};

use crate::ledger::Address;

/// A fixed table of async locks indexed by address hash.
///
/// Two addresses may share a slot; that only costs concurrency. Slots are
/// always taken in ascending index order, so two transfers over the same pair
/// of addresses cannot deadlock.
pub struct AddressLocks {
    slots: Vec<Mutex<()>>,
}

impl AddressLocks {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, addresses: &[&Address]) -> Vec<MutexGuard<'_, ()>> {
        let mut indices: Vec<usize> = addresses
            .iter()
            .map(|address| address.shard(self.slots.len()))
            .collect();
        indices.sort_unstable();
        indices.dedup();

        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            guards.push(self.slots[index].lock().await);
        }
        guards
    }
}
