//! Bounded FIFO of scraped items waiting for the pipeline, paired with the
//! response they came from. `active` counts items currently inside the
//! pipeline; the cap bounds that, not the queue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use crate::response::Response;
use crate::settings::Settings;
use crate::spider::Item;

#[derive(Clone, Debug)]
pub struct QueuedItem {
    pub item: Item,
    pub response: Option<Response>,
}

struct ItemSlotInner {
    queue: VecDeque<QueuedItem>,
    active: i64,
}

pub struct ItemSlot {
    inner: Mutex<ItemSlotInner>,
    concurrent_items: i64,
}

impl ItemSlot {
    pub fn new(settings: &Settings) -> Self {
        ItemSlot {
            inner: Mutex::new(ItemSlotInner {
                queue: VecDeque::new(),
                active: 0,
            }),
            concurrent_items: settings.get_i64("CONCURRENT_ITEMS", 100),
        }
    }

    pub fn push(&self, item: QueuedItem) {
        self.inner.lock().queue.push_back(item);
    }

    /// Dequeue the oldest item and count it as active.
    pub fn pop(&self) -> Option<QueuedItem> {
        let mut inner = self.inner.lock();
        let item = inner.queue.pop_front()?;
        inner.active += 1;
        Some(item)
    }

    pub fn finish(&self) {
        self.inner.lock().active -= 1;
    }

    /// A cap of zero or less means unlimited.
    pub fn is_free(&self) -> bool {
        if self.concurrent_items <= 0 {
            return true;
        }
        self.inner.lock().active < self.concurrent_items
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.queue.is_empty() && inner.active <= 0
    }

    pub fn close(&self) {
        let inner = self.inner.lock();
        debug!(queued = inner.queue.len(), active = inner.active, "item slot closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(n: i64) -> QueuedItem {
        QueuedItem {
            item: json!({ "n": n }),
            response: None,
        }
    }

    #[test]
    fn fifo_order() {
        let settings = Settings::with_defaults();
        let slot = ItemSlot::new(&settings);
        slot.push(item(1));
        slot.push(item(2));
        assert_eq!(slot.pop().unwrap().item["n"], 1);
        assert_eq!(slot.pop().unwrap().item["n"], 2);
        assert!(slot.pop().is_none());
    }

    #[test]
    fn cap_limits_active_not_queue() {
        let settings = Settings::with_defaults();
        settings.set("CONCURRENT_ITEMS", 2);
        let slot = ItemSlot::new(&settings);
        for n in 0..5 {
            slot.push(item(n));
        }
        assert!(slot.is_free());

        slot.pop();
        slot.pop();
        assert!(!slot.is_free());

        slot.finish();
        assert!(slot.is_free());
    }

    #[test]
    fn empty_requires_no_queue_and_no_active() {
        let settings = Settings::with_defaults();
        let slot = ItemSlot::new(&settings);
        assert!(slot.is_empty());

        slot.push(item(1));
        assert!(!slot.is_empty());

        slot.pop();
        assert!(!slot.is_empty(), "active item keeps the slot non-empty");

        slot.finish();
        assert!(slot.is_empty());
    }
}
