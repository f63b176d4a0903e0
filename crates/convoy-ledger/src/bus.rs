//! In-process event fan-out.
//!
//! Two subscription modes: global (every event) and per-item (filtered by
//! the event's `itemId`). Publishing never blocks: each subscriber owns a
//! bounded queue and a full or disconnected queue drops the message for that
//! subscriber only. Disconnected subscribers are pruned on the next publish.
//! The bus retains no history; late subscribers replay from the ledger.

use std::collections::HashMap;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use tracing::debug;

use convoy_types::{EventRecord, ItemId};

/// Depth of each subscriber queue. A subscriber that falls this far behind
/// starts losing events rather than stalling the engine.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

struct BusInner {
    global: Vec<SyncSender<EventRecord>>,
    per_item: HashMap<ItemId, Vec<SyncSender<EventRecord>>>,
}

/// Cloneable handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                global: Vec::new(),
                per_item: HashMap::new(),
            })),
        }
    }

    /// Subscribe to every event published on this bus.
    pub fn subscribe_all(&self) -> Receiver<EventRecord> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE_DEPTH);
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .global
            .push(tx);
        rx
    }

    /// Subscribe to the events of one item.
    pub fn subscribe_item(&self, item_id: &ItemId) -> Receiver<EventRecord> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE_DEPTH);
        self.inner
            .lock()
            .expect("event bus lock poisoned")
            .per_item
            .entry(item_id.clone())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver an event to all matching live subscribers without blocking.
    pub fn publish(&self, event: &EventRecord) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        fan_out(&mut inner.global, event);

        let mut drained = false;
        if let Some(subs) = inner.per_item.get_mut(&event.item_id) {
            fan_out(subs, event);
            drained = subs.is_empty();
        }
        if drained {
            inner.per_item.remove(&event.item_id);
        }
    }

    /// Number of live subscribers, for diagnostics.
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner.global.len() + inner.per_item.values().map(Vec::len).sum::<usize>()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Try-send to every sender in the list, pruning disconnected ones.
fn fan_out(senders: &mut Vec<SyncSender<EventRecord>>, event: &EventRecord) {
    senders.retain(|tx| match tx.try_send(event.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!(kind = event.kind.tag(), "slow subscriber, dropping event");
            true
        }
        Err(TrySendError::Disconnected(_)) => false,
    });
}
