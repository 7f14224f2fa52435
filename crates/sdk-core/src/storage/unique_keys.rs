//! Deduplicated (feature, key) pairs seen since the last flush

use super::RecorderCache;
use crate::util::lock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Members of one group, in first-seen order
#[derive(Debug, Default, Clone)]
struct Group {
    members: Vec<String>,
    seen: HashSet<String>,
}

#[derive(Debug, Default)]
struct Tracker {
    order: Vec<String>,
    groups: HashMap<String, Group>,
    size: usize,
}

/// Unique keys grouped by feature (server side) or by key (client side)
#[derive(Debug)]
pub struct UniqueKeysCache {
    tracker: Mutex<Tracker>,
    max_size: usize,
    client_side: bool,
    on_full_queue: Arc<Notify>,
}

#[derive(Debug, Serialize, PartialEq)]
struct FeatureKeys<'a> {
    f: &'a str,
    ks: &'a [String],
}

#[derive(Debug, Serialize, PartialEq)]
struct KeyFeatures<'a> {
    k: &'a str,
    fs: &'a [String],
}

#[derive(Debug, Serialize)]
struct Payload<T> {
    keys: Vec<T>,
}

impl UniqueKeysCache {
    pub fn new(max_size: usize, client_side: bool) -> Self {
        Self {
            tracker: Mutex::new(Tracker::default()),
            max_size,
            client_side,
            on_full_queue: Arc::new(Notify::new()),
        }
    }

    pub fn is_client_side(&self) -> bool {
        self.client_side
    }

    /// Records that `key` was evaluated for `feature`.
    ///
    /// Returns whether the pair was new since the last flush.
    pub fn track(&self, key: &str, feature: &str) -> bool {
        let (group, member) = if self.client_side {
            (key, feature)
        } else {
            (feature, key)
        };

        let (added, full) = {
            let mut guard = lock(&self.tracker);
            let tracker = &mut *guard;
            if !tracker.groups.contains_key(group) {
                tracker.order.push(group.to_string());
            }
            let entry = tracker.groups.entry(group.to_string()).or_default();
            let added = entry.seen.insert(member.to_string());
            if added {
                entry.members.push(member.to_string());
                tracker.size += 1;
            }
            let full = self.max_size > 0 && tracker.size >= self.max_size;
            if full {
                tracker.size = 0;
            }
            (added, full)
        };

        if full {
            self.on_full_queue.notify_one();
        }
        added
    }

    /// Number of distinct pairs tracked since the last flush
    pub fn len(&self) -> usize {
        lock(&self.tracker)
            .groups
            .values()
            .map(|g| g.members.len())
            .sum()
    }

    /// Serializes a batch into the collector's wire format:
    /// `{"keys":[{"f","ks"}]}` server side, `{"keys":[{"k","fs"}]}` client side.
    pub fn to_payload(&self, batch: &[(String, Vec<String>)]) -> serde_json::Value {
        let result = if self.client_side {
            serde_json::to_value(Payload {
                keys: batch
                    .iter()
                    .map(|(k, fs)| KeyFeatures { k, fs })
                    .collect(),
            })
        } else {
            serde_json::to_value(Payload {
                keys: batch
                    .iter()
                    .map(|(f, ks)| FeatureKeys { f, ks })
                    .collect(),
            })
        };
        result.unwrap_or(serde_json::Value::Null)
    }
}

fn snapshot(tracker: &Tracker) -> Vec<(String, Vec<String>)> {
    tracker
        .order
        .iter()
        .filter_map(|g| {
            tracker
                .groups
                .get(g)
                .map(|group| (g.clone(), group.members.clone()))
        })
        .collect()
}

impl RecorderCache for UniqueKeysCache {
    /// Groups with their members, both in first-seen order
    type Batch = Vec<(String, Vec<String>)>;

    fn is_empty(&self) -> bool {
        lock(&self.tracker).groups.is_empty()
    }

    fn state(&self) -> Self::Batch {
        snapshot(&lock(&self.tracker))
    }

    fn clear(&self) {
        *lock(&self.tracker) = Tracker::default();
    }

    fn pop(&self) -> Self::Batch {
        let taken = std::mem::take(&mut *lock(&self.tracker));
        snapshot(&taken)
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        Some(self.on_full_queue.clone())
    }
}
