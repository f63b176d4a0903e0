//! Per-item FIFO serialization locks.
//!
//! Review-receive requests for one item must execute strictly one after
//! another, in arrival order. Each item gets a ticket queue: a request takes
//! the next ticket, waits until the queue serves its number, and releases by
//! bumping the served counter. The map entry disappears when the last holder
//! releases with nobody waiting, so idle items cost nothing.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use convoy_types::ItemId;

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    now_serving: u64,
}

#[derive(Default)]
struct TicketQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Process-scoped map of per-item ticket queues.
#[derive(Clone, Default)]
pub struct ItemLocks {
    inner: Arc<Mutex<HashMap<ItemId, Arc<TicketQueue>>>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until this caller holds the item's lock; FIFO across callers.
    pub fn acquire(&self, item_id: &ItemId) -> ItemLockGuard {
        let queue = {
            let mut map = self.inner.lock().expect("item locks poisoned");
            Arc::clone(map.entry(item_id.clone()).or_default())
        };

        let ticket = {
            let mut state = queue.state.lock().expect("ticket queue poisoned");
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };

        let mut state = queue.state.lock().expect("ticket queue poisoned");
        while state.now_serving != ticket {
            state = queue.ready.wait(state).expect("ticket queue poisoned");
        }
        drop(state);

        ItemLockGuard {
            locks: Arc::clone(&self.inner),
            queue,
            item_id: item_id.clone(),
        }
    }

    /// Number of items with an active queue, for diagnostics and tests.
    pub fn active_items(&self) -> usize {
        self.inner.lock().expect("item locks poisoned").len()
    }
}

/// Holding this guard means holding the item's lock.
pub struct ItemLockGuard {
    locks: Arc<Mutex<HashMap<ItemId, Arc<TicketQueue>>>>,
    queue: Arc<TicketQueue>,
    item_id: ItemId,
}

impl Drop for ItemLockGuard {
    fn drop(&mut self) {
        let drained = {
            let mut state = self.queue.state.lock().expect("ticket queue poisoned");
            state.now_serving += 1;
            state.now_serving == state.next_ticket
        };
        self.queue.ready.notify_all();

        if drained {
            let mut map = self.locks.lock().expect("item locks poisoned");
            // Re-check under the map lock: a newcomer may have taken a
            // ticket between our drain check and here.
            if let Some(queue) = map.get(&self.item_id) {
                let state = queue.state.lock().expect("ticket queue poisoned");
                if state.now_serving == state.next_ticket {
                    drop(state);
                    map.remove(&self.item_id);
                }
            }
        }
    }
}
