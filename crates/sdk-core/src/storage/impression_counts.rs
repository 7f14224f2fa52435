//! Per-feature, per-hour impression counters

use super::RecorderCache;
use crate::util::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const HOUR_MS: i64 = 3_600_000;

/// Truncates an epoch-millis timestamp to the start of its hour
pub fn truncate_time_frame(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(HOUR_MS)
}

fn make_key(feature: &str, time_frame: i64) -> String {
    format!("{}::{}", feature, truncate_time_frame(time_frame))
}

/// Impression counts keyed by `feature::hour`
#[derive(Debug)]
pub struct ImpressionCountsCache {
    counts: Mutex<HashMap<String, u64>>,
    max_size: usize,
    on_full_queue: Arc<Notify>,
}

impl ImpressionCountsCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            max_size,
            on_full_queue: Arc::new(Notify::new()),
        }
    }

    pub fn track(&self, feature: &str, time_frame: i64, amount: u64) {
        let len = {
            let mut counts = lock(&self.counts);
            *counts.entry(make_key(feature, time_frame)).or_insert(0) += amount;
            counts.len()
        };
        if self.max_size > 0 && len >= self.max_size {
            self.on_full_queue.notify_one();
        }
    }

    /// Splits a `feature::hour` key back into its parts
    pub fn parse_key(key: &str) -> Option<(&str, i64)> {
        let (feature, time_frame) = key.rsplit_once("::")?;
        Some((feature, time_frame.parse().ok()?))
    }
}

impl RecorderCache for ImpressionCountsCache {
    type Batch = HashMap<String, u64>;

    fn is_empty(&self) -> bool {
        lock(&self.counts).is_empty()
    }

    fn state(&self) -> Self::Batch {
        lock(&self.counts).clone()
    }

    fn clear(&self) {
        lock(&self.counts).clear();
    }

    fn pop(&self) -> Self::Batch {
        std::mem::take(&mut *lock(&self.counts))
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        Some(self.on_full_queue.clone())
    }
}
