//! Unique keys tracking for the NONE impressions mode

use crate::storage::{RecorderCache, UniqueKeysCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of pairs handed to the sender at once
pub const DEFAULT_CACHE_SIZE: usize = 30_000;

/// Membership filter consulted before tracking a (feature, key) pair
pub trait FilterAdapter: Send + Sync {
    /// Adds the pair; returns `false` if it was already present
    fn add(&self, feature: &str, key: &str) -> bool;
    fn contains(&self, feature: &str, key: &str) -> bool;
    fn clear(&self);
}

/// Filter that accepts every pair
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFilter;

impl FilterAdapter for NoopFilter {
    fn add(&self, _feature: &str, _key: &str) -> bool {
        true
    }

    fn contains(&self, _feature: &str, _key: &str) -> bool {
        true
    }

    fn clear(&self) {}
}

/// Out-of-band receiver of unique keys batches
pub trait ImpressionSenderAdapter: Send + Sync {
    fn record_unique_keys(&self, batch: Vec<(String, Vec<String>)>);
}

/// Collapses repeated (feature, key) pairs into the unique keys cache and
/// hands the accumulated content to a sender once `cache_size` new pairs
/// were seen
pub struct UniqueKeysTracker {
    cache: Arc<UniqueKeysCache>,
    filter: Box<dyn FilterAdapter>,
    sender: Option<Box<dyn ImpressionSenderAdapter>>,
    cache_size: usize,
    tracked: AtomicUsize,
}

impl UniqueKeysTracker {
    pub fn new(cache: Arc<UniqueKeysCache>) -> Self {
        Self {
            cache,
            filter: Box::new(NoopFilter),
            sender: None,
            cache_size: DEFAULT_CACHE_SIZE,
            tracked: AtomicUsize::new(0),
        }
    }

    pub fn with_filter(mut self, filter: impl FilterAdapter + 'static) -> Self {
        self.filter = Box::new(filter);
        self
    }

    pub fn with_sender(mut self, sender: impl ImpressionSenderAdapter + 'static) -> Self {
        self.sender = Some(Box::new(sender));
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn track(&self, feature: &str, key: &str) {
        if !self.filter.add(feature, key) {
            debug!(feature = %feature, key = %key, "Pair already present in the filter");
            return;
        }
        if !self.cache.track(key, feature) {
            return;
        }

        let tracked = self.tracked.fetch_add(1, Ordering::SeqCst) + 1;
        if tracked >= self.cache_size {
            self.tracked.store(0, Ordering::SeqCst);
            warn!(size = tracked, "Unique keys tracker reached its maximum size");
            if let Some(sender) = &self.sender {
                sender.record_unique_keys(self.cache.pop());
            }
        }
    }
}
