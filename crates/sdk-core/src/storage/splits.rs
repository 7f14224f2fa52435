//! Flag definitions cache

use crate::models::FlagRecord;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// Flag snapshot with per-traffic-type reference counts.
///
/// Written only by the flag fetch path; read concurrently by evaluation.
#[derive(Debug)]
pub struct SplitsCache {
    flags: DashMap<String, FlagRecord>,
    traffic_types: DashMap<String, usize>,
    splits_with_segments: AtomicUsize,
    change_number: AtomicI64,
}

impl Default for SplitsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SplitsCache {
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
            traffic_types: DashMap::new(),
            splits_with_segments: AtomicUsize::new(0),
            change_number: AtomicI64::new(-1),
        }
    }

    /// Stores a flag, replacing any previous definition with the same name
    pub fn add_split(&self, flag: FlagRecord) -> bool {
        let previous = self.flags.insert(flag.name.clone(), flag.clone());
        if let Some(previous) = previous {
            self.release(&previous);
        }

        if let Some(tt) = &flag.traffic_type_name {
            *self.traffic_types.entry(tt.clone()).or_insert(0) += 1;
        }
        if flag.uses_segments() {
            self.splits_with_segments.fetch_add(1, Ordering::SeqCst);
        }
        true
    }

    pub fn add_splits(&self, flags: impl IntoIterator<Item = FlagRecord>) -> Vec<bool> {
        flags.into_iter().map(|f| self.add_split(f)).collect()
    }

    /// Returns whether a flag was removed
    pub fn remove_split(&self, name: &str) -> bool {
        match self.flags.remove(name) {
            Some((_, flag)) => {
                self.release(&flag);
                true
            }
            None => false,
        }
    }

    pub fn remove_splits<S: AsRef<str>>(&self, names: &[S]) -> Vec<bool> {
        names.iter().map(|n| self.remove_split(n.as_ref())).collect()
    }

    fn release(&self, flag: &FlagRecord) {
        if let Some(tt) = &flag.traffic_type_name {
            let emptied = match self.traffic_types.get_mut(tt) {
                Some(mut count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if emptied {
                self.traffic_types.remove_if(tt, |_, count| *count == 0);
            }
        }
        if flag.uses_segments() {
            let _ = self
                .splits_with_segments
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    pub fn get_split(&self, name: &str) -> Option<FlagRecord> {
        self.flags.get(name).map(|f| f.value().clone())
    }

    /// Looks up several flags; missing ones map to `None`
    pub fn get_splits<S: AsRef<str>>(&self, names: &[S]) -> HashMap<String, Option<FlagRecord>> {
        names
            .iter()
            .map(|n| (n.as_ref().to_string(), self.get_split(n.as_ref())))
            .collect()
    }

    pub fn get_all(&self) -> Vec<FlagRecord> {
        self.flags.iter().map(|f| f.value().clone()).collect()
    }

    pub fn get_split_names(&self) -> Vec<String> {
        self.flags.iter().map(|f| f.key().clone()).collect()
    }

    pub fn set_change_number(&self, change_number: i64) {
        self.change_number.store(change_number, Ordering::SeqCst);
    }

    /// -1 until the first successful fetch
    pub fn get_change_number(&self) -> i64 {
        self.change_number.load(Ordering::SeqCst)
    }

    pub fn traffic_type_exists(&self, traffic_type: &str) -> bool {
        self.traffic_types
            .get(traffic_type)
            .map(|count| *count > 0)
            .unwrap_or(false)
    }

    /// True while nothing was fetched yet, or when some flag targets segments
    pub fn uses_segments(&self) -> bool {
        self.get_change_number() == -1 || self.splits_with_segments.load(Ordering::SeqCst) > 0
    }

    /// Kills a flag until the next fetch overrides it.
    ///
    /// Applied only when `change_number` is newer than the stored flag's.
    /// The cache-level change number is left alone so the next fetch still
    /// retrieves the authoritative definition.
    pub fn kill_locally(&self, name: &str, default_treatment: &str, change_number: i64) -> bool {
        let Some(mut flag) = self.get_split(name) else {
            return false;
        };
        if flag.change_number >= change_number {
            return false;
        }
        flag.killed = true;
        flag.default_treatment = default_treatment.to_string();
        flag.change_number = change_number;
        self.add_split(flag)
    }

    /// Whether a previously loaded snapshot is available
    pub fn check_cache(&self) -> bool {
        self.get_change_number() > -1
    }

    pub fn clear(&self) {
        self.flags.clear();
        self.traffic_types.clear();
        self.splits_with_segments.store(0, Ordering::SeqCst);
        self.change_number.store(-1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flag(name: &str, definition: &str) -> FlagRecord {
        FlagRecord::parse(name, definition).unwrap()
    }

    #[test]
    fn test_add_get_remove() {
        let cache = SplitsCache::new();
        cache.add_split(flag("lol1", r#"{"killed": false}"#));
        cache.add_split(flag("lol2", r#"{"killed": true}"#));
        assert_eq!(cache.get_all().len(), 2);

        assert!(cache.remove_split("lol1"));
        assert!(!cache.remove_split("lol1"));

        let splits = cache.get_splits(&["lol1", "lol2"]);
        assert!(splits["lol1"].is_none());
        assert!(splits["lol2"].as_ref().unwrap().killed);

        cache.set_change_number(123);
        assert_eq!(cache.get_change_number(), 123);
    }

    #[test]
    fn test_split_names() {
        let cache = SplitsCache::new();
        cache.add_splits(vec![FlagRecord::new("lol1"), FlagRecord::new("lol2")]);
        let mut names = cache.get_split_names();
        names.sort();
        assert_eq!(names, vec!["lol1", "lol2"]);
    }

    #[test]
    fn test_traffic_type_reference_counts() {
        let cache = SplitsCache::new();
        cache.add_splits(vec![
            flag("split1", r#"{"trafficTypeName": "user_tt"}"#),
            flag("split2", r#"{"trafficTypeName": "account_tt"}"#),
            flag("split3", r#"{"trafficTypeName": "user_tt"}"#),
            flag("malformed", "{}"),
        ]);
        cache.add_split(flag("split4", r#"{"trafficTypeName": "user_tt"}"#));

        assert!(cache.traffic_type_exists("user_tt"));
        assert!(cache.traffic_type_exists("account_tt"));
        assert!(!cache.traffic_type_exists("not_existent_tt"));

        cache.remove_split("split4");
        assert!(cache.traffic_type_exists("user_tt"));

        cache.remove_splits(&["split3", "split2"]);
        assert!(cache.traffic_type_exists("user_tt"));
        assert!(!cache.traffic_type_exists("account_tt"));

        cache.remove_split("split1");
        assert!(!cache.traffic_type_exists("user_tt"));

        cache.add_split(flag("split1", r#"{"trafficTypeName": "user_tt"}"#));
        assert!(cache.traffic_type_exists("user_tt"));

        // Redefining a flag moves its reference to the new traffic type
        cache.add_split(flag("split1", r#"{"trafficTypeName": "account_tt"}"#));
        assert!(cache.traffic_type_exists("account_tt"));
        assert!(!cache.traffic_type_exists("user_tt"));
    }

    #[test]
    fn test_kill_locally() {
        let cache = SplitsCache::new();
        cache.add_split(FlagRecord::new("lol1"));
        let initial = cache.get_change_number();

        assert!(!cache.kill_locally("nonexistent_split", "other_treatment", 101));
        assert!(cache.get_split("nonexistent_split").is_none());

        assert!(cache.kill_locally("lol1", "some_treatment", 100));
        let killed = cache.get_split("lol1").unwrap();
        assert!(killed.killed);
        assert_eq!(killed.default_treatment, "some_treatment");
        assert_eq!(killed.change_number, 100);
        assert_eq!(cache.get_change_number(), initial);

        assert!(!cache.kill_locally("lol1", "some_treatment_2", 90));
        assert_eq!(cache.get_split("lol1").unwrap().default_treatment, "some_treatment");
    }

    #[test]
    fn test_uses_segments() {
        let cache = SplitsCache::new();
        assert!(cache.uses_segments());

        cache.set_change_number(1);
        cache.add_split(FlagRecord::new("plain"));
        assert!(!cache.uses_segments());

        let segmented = flag(
            "segmented",
            r#"{"conditions": [{"matcherGroup": {"matchers": [
                {"matcherType": "IN_SEGMENT", "userDefinedSegmentMatcherData": {"segmentName": "beta"}}
            ]}}]}"#,
        );
        cache.add_split(segmented);
        assert!(cache.uses_segments());

        cache.remove_split("segmented");
        assert!(!cache.uses_segments());
    }

    #[test]
    fn test_clear_resets_change_number() {
        let cache = SplitsCache::new();
        cache.add_split(flag("split1", r#"{"trafficTypeName": "user_tt"}"#));
        cache.set_change_number(5);
        assert!(cache.check_cache());

        cache.clear();
        assert!(!cache.check_cache());
        assert!(!cache.traffic_type_exists("user_tt"));
    }
}
