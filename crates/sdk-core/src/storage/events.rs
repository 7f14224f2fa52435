//! Custom events queue

use super::RecorderCache;
use crate::models::EventRecord;
use crate::util::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Queued payload size that triggers an early flush (5 MiB)
pub const MAX_QUEUE_BYTE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Default)]
struct EventsQueue {
    events: Vec<EventRecord>,
    byte_size: usize,
}

/// Events buffer bounded by count and by estimated byte size
#[derive(Debug)]
pub struct EventsCache {
    queue: Mutex<EventsQueue>,
    max_queue_size: usize,
    on_full_queue: Arc<Notify>,
}

impl EventsCache {
    /// A `max_queue_size` of zero only signals on byte size
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queue: Mutex::new(EventsQueue::default()),
            max_queue_size,
            on_full_queue: Arc::new(Notify::new()),
        }
    }

    /// Appends an event with its estimated serialized size; never rejects
    pub fn track(&self, event: EventRecord, size: usize) -> bool {
        let (len, byte_size) = {
            let mut queue = lock(&self.queue);
            queue.events.push(event);
            queue.byte_size += size;
            (queue.events.len(), queue.byte_size)
        };

        if byte_size > MAX_QUEUE_BYTE_SIZE
            || (self.max_queue_size > 0 && len >= self.max_queue_size)
        {
            self.on_full_queue.notify_one();
        }
        true
    }

    pub fn byte_size(&self) -> usize {
        lock(&self.queue).byte_size
    }
}

impl RecorderCache for EventsCache {
    type Batch = Vec<EventRecord>;

    fn is_empty(&self) -> bool {
        lock(&self.queue).events.is_empty()
    }

    fn state(&self) -> Self::Batch {
        lock(&self.queue).events.clone()
    }

    fn clear(&self) {
        let mut queue = lock(&self.queue);
        queue.events.clear();
        queue.byte_size = 0;
    }

    fn pop(&self) -> Self::Batch {
        std::mem::take(&mut *lock(&self.queue)).events
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        Some(self.on_full_queue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(key: &str) -> EventRecord {
        EventRecord {
            event_type_id: "checkout".to_string(),
            traffic_type_name: "user".to_string(),
            value: None,
            timestamp: 1000,
            key: key.to_string(),
            properties: None,
        }
    }

    async fn signalled(signal: &Notify) -> bool {
        tokio::time::timeout(Duration::from_millis(10), signal.notified())
            .await
            .is_ok()
    }

    #[tokio::test]
    async fn test_signals_on_count() {
        let cache = EventsCache::new(2);
        let signal = cache.full_queue_signal().unwrap();

        cache.track(event("a"), 10);
        assert!(!signalled(&signal).await);

        cache.track(event("b"), 10);
        assert!(signalled(&signal).await);
    }

    #[tokio::test]
    async fn test_signals_on_byte_size() {
        let cache = EventsCache::new(500);
        let signal = cache.full_queue_signal().unwrap();

        cache.track(event("a"), MAX_QUEUE_BYTE_SIZE);
        assert!(!signalled(&signal).await);

        cache.track(event("b"), 1);
        assert!(signalled(&signal).await);
    }

    #[test]
    fn test_pop_resets_byte_size() {
        let cache = EventsCache::new(500);
        cache.track(event("a"), 100);
        cache.track(event("b"), 50);
        assert_eq!(cache.byte_size(), 150);

        let batch = cache.pop();
        assert_eq!(batch.len(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.byte_size(), 0);
    }
}
