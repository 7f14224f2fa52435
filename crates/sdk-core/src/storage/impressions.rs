//! Impressions queue

use super::RecorderCache;
use crate::models::ImpressionRecord;
use crate::util::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Ordered impressions buffer, drained by the impressions submitter
#[derive(Debug)]
pub struct ImpressionsCache {
    queue: Mutex<Vec<ImpressionRecord>>,
    max_queue_size: usize,
    on_full_queue: Arc<Notify>,
}

impl ImpressionsCache {
    /// A `max_queue_size` of zero never signals a full queue
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            max_queue_size,
            on_full_queue: Arc::new(Notify::new()),
        }
    }

    /// Appends impressions in order; never rejects
    pub fn track(&self, impressions: Vec<ImpressionRecord>) -> bool {
        let len = {
            let mut queue = lock(&self.queue);
            queue.extend(impressions);
            queue.len()
        };
        if self.max_queue_size > 0 && len >= self.max_queue_size {
            self.on_full_queue.notify_one();
        }
        true
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl RecorderCache for ImpressionsCache {
    type Batch = Vec<ImpressionRecord>;

    fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    fn state(&self) -> Self::Batch {
        lock(&self.queue).clone()
    }

    fn clear(&self) {
        lock(&self.queue).clear();
    }

    fn pop(&self) -> Self::Batch {
        std::mem::take(&mut *lock(&self.queue))
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        Some(self.on_full_queue.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impression(key: &str) -> ImpressionRecord {
        ImpressionRecord {
            feature: "f1".to_string(),
            key_name: key.to_string(),
            bucketing_key: None,
            treatment: "on".to_string(),
            label: Some("default rule".to_string()),
            time: 1000,
            change_number: 1,
            previous_time: None,
        }
    }

    #[test]
    fn test_track_and_pop() {
        let cache = ImpressionsCache::new(10);
        assert!(cache.is_empty());

        cache.track(vec![impression("a"), impression("b")]);
        assert_eq!(cache.state().len(), 2);

        let batch = cache.pop();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key_name, "a");
        assert!(cache.is_empty());

        // Records tracked after a pop belong to the next batch only
        cache.track(vec![impression("c")]);
        assert_eq!(batch.len(), 2);
        assert_eq!(cache.pop()[0].key_name, "c");
    }

    #[tokio::test]
    async fn test_full_queue_signal() {
        let cache = ImpressionsCache::new(2);
        let signal = cache.full_queue_signal().unwrap();

        cache.track(vec![impression("a")]);
        cache.track(vec![impression("b")]);

        // The permit stored by notify_one completes immediately
        tokio::time::timeout(std::time::Duration::from_millis(10), signal.notified())
            .await
            .expect("full queue should have been signalled");
    }
}
