//! Segment membership caches

use crate::models::SegmentRecord;
use crate::util::lock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

/// Server-side segments: every registered segment with its member keys
#[derive(Debug, Default)]
pub struct SegmentsCache {
    segments: Mutex<HashMap<String, SegmentRecord>>,
}

impl SegmentsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_to_segment<S: AsRef<str>>(&self, name: &str, keys: &[S]) {
        let mut segments = lock(&self.segments);
        let segment = segments
            .entry(name.to_string())
            .or_insert_with(|| SegmentRecord::new(name));
        segment
            .keys
            .extend(keys.iter().map(|k| k.as_ref().to_string()));
    }

    pub fn remove_from_segment<S: AsRef<str>>(&self, name: &str, keys: &[S]) {
        if let Some(segment) = lock(&self.segments).get_mut(name) {
            for key in keys {
                segment.keys.remove(key.as_ref());
            }
        }
    }

    pub fn is_in_segment(&self, name: &str, key: &str) -> bool {
        lock(&self.segments)
            .get(name)
            .map(|s| s.keys.contains(key))
            .unwrap_or(false)
    }

    /// Registers segment names to be fetched; returns whether any was new
    pub fn register_segments<S: AsRef<str>>(&self, names: &[S]) -> bool {
        let mut segments = lock(&self.segments);
        let mut added = false;
        for name in names {
            let name = name.as_ref();
            if !segments.contains_key(name) {
                segments.insert(name.to_string(), SegmentRecord::new(name));
                added = true;
            }
        }
        added
    }

    pub fn get_registered_segments(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.segments).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_change_number(&self, name: &str, change_number: i64) {
        let mut segments = lock(&self.segments);
        segments
            .entry(name.to_string())
            .or_insert_with(|| SegmentRecord::new(name))
            .change_number = change_number;
    }

    /// -1 for unknown segments
    pub fn get_change_number(&self, name: &str) -> i64 {
        lock(&self.segments)
            .get(name)
            .map(|s| s.change_number)
            .unwrap_or(-1)
    }

    pub fn get_segment(&self, name: &str) -> Option<SegmentRecord> {
        lock(&self.segments).get(name).cloned()
    }

    pub fn clear(&self) {
        lock(&self.segments).clear();
    }
}

/// Client-side segments: names of the segments one matching key belongs to
#[derive(Debug, Default)]
pub struct MySegmentsCache {
    names: Mutex<BTreeSet<String>>,
}

impl MySegmentsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the membership list; returns whether it changed
    pub fn reset_segments<S: AsRef<str>>(&self, names: &[S]) -> bool {
        let next: BTreeSet<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        let mut current = lock(&self.names);
        if *current == next {
            return false;
        }
        *current = next;
        true
    }

    pub fn add_to_segment(&self, name: &str) -> bool {
        lock(&self.names).insert(name.to_string())
    }

    pub fn remove_from_segment(&self, name: &str) -> bool {
        lock(&self.names).remove(name)
    }

    pub fn is_in_segment(&self, name: &str) -> bool {
        lock(&self.names).contains(name)
    }

    pub fn get_registered_segments(&self) -> Vec<String> {
        lock(&self.names).iter().cloned().collect()
    }

    pub fn clear(&self) {
        lock(&self.names).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_membership() {
        let cache = SegmentsCache::new();
        cache.add_to_segment("employees", &["emma", "nico"]);
        assert!(cache.is_in_segment("employees", "emma"));
        assert!(!cache.is_in_segment("employees", "john"));
        assert!(!cache.is_in_segment("unknown", "emma"));

        cache.remove_from_segment("employees", &["emma"]);
        assert!(!cache.is_in_segment("employees", "emma"));
        assert!(cache.is_in_segment("employees", "nico"));
    }

    #[test]
    fn test_register_and_change_numbers() {
        let cache = SegmentsCache::new();
        assert!(cache.register_segments(&["a", "b"]));
        assert!(!cache.register_segments(&["a"]));
        assert_eq!(cache.get_registered_segments(), vec!["a", "b"]);

        assert_eq!(cache.get_change_number("a"), -1);
        cache.set_change_number("a", 42);
        assert_eq!(cache.get_change_number("a"), 42);

        cache.clear();
        assert!(cache.get_registered_segments().is_empty());
    }

    #[test]
    fn test_my_segments_reset_reports_changes() {
        let cache = MySegmentsCache::new();
        assert!(cache.reset_segments(&["beta", "employees"]));
        assert!(!cache.reset_segments(&["employees", "beta"]));
        assert!(cache.is_in_segment("beta"));

        assert!(cache.reset_segments(&["beta"]));
        assert!(!cache.is_in_segment("employees"));
        assert_eq!(cache.get_registered_segments(), vec!["beta"]);

        // An empty membership list is a valid, already applied state
        cache.clear();
        assert!(!cache.reset_segments::<&str>(&[]));
    }
}
