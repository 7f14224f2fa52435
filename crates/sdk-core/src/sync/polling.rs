//! Fetch-and-apply updaters and the polling manager that schedules them

use super::task::{SyncTask, TaskJob};
use super::transport::DataFetcher;
use crate::models::{FlagRecord, FlagStatus};
use crate::observability::SyncMetrics;
use crate::readiness::ReadinessManager;
use crate::storage::{MySegmentsCache, SegmentsCache, SplitsCache};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fetches flag changes until caught up and applies them to the flags cache
pub struct SplitChangesUpdater {
    fetcher: Arc<dyn DataFetcher>,
    splits: Arc<SplitsCache>,
    /// Server side: segments referenced by flags get registered for fetching
    segments: Option<Arc<SegmentsCache>>,
    readiness: Arc<ReadinessManager>,
    metrics: SyncMetrics,
    arrived: AtomicBool,
}

impl SplitChangesUpdater {
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        splits: Arc<SplitsCache>,
        segments: Option<Arc<SegmentsCache>>,
        readiness: Arc<ReadinessManager>,
    ) -> Self {
        Self {
            fetcher,
            splits,
            segments,
            readiness,
            metrics: SyncMetrics::new(),
            arrived: AtomicBool::new(false),
        }
    }

    /// Applies one page of changes; returns whether the cache changed
    fn apply(&self, flags: Vec<serde_json::Value>, till: i64) -> bool {
        let mut changed = false;
        let mut referenced = BTreeSet::new();

        for raw in flags {
            let flag: FlagRecord = match serde_json::from_value(raw) {
                Ok(flag) => flag,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed flag definition");
                    continue;
                }
            };
            match flag.status {
                FlagStatus::Active => {
                    referenced.extend(flag.segment_names());
                    changed |= self.splits.add_split(flag);
                }
                FlagStatus::Archived => {
                    changed |= self.splits.remove_split(&flag.name);
                }
            }
        }

        if let Some(segments) = &self.segments {
            let names: Vec<String> = referenced.into_iter().collect();
            segments.register_segments(&names);
        }
        self.splits.set_change_number(till);
        changed
    }
}

#[async_trait]
impl TaskJob for SplitChangesUpdater {
    fn name(&self) -> &str {
        "split_changes"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let mut changed = false;
        loop {
            let since = self.splits.get_change_number();
            let start = Instant::now();
            let changes = match self.fetcher.fetch_split_changes(since).await {
                Ok(changes) => changes,
                Err(e) => {
                    self.metrics.inc_fetch_errors("splits");
                    return Err(e).context("Failed to fetch flag changes");
                }
            };
            self.metrics
                .observe_fetch_latency("splits", start.elapsed().as_secs_f64());

            let count = changes.splits.len();
            changed |= self.apply(changes.splits, changes.till);
            debug!(since, till = changes.till, flags = count, "Applied flag changes");

            if changes.till <= since {
                break;
            }
        }

        if changed || !self.arrived.swap(true, Ordering::SeqCst) {
            self.readiness.on_splits_arrived(false);
        }
        Ok(())
    }
}

/// Fetches the segment names of one matching key
pub struct MySegmentsUpdater {
    fetcher: Arc<dyn DataFetcher>,
    key: String,
    my_segments: Arc<MySegmentsCache>,
    readiness: Arc<ReadinessManager>,
    metrics: SyncMetrics,
}

impl MySegmentsUpdater {
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        key: impl Into<String>,
        my_segments: Arc<MySegmentsCache>,
        readiness: Arc<ReadinessManager>,
    ) -> Self {
        Self {
            fetcher,
            key: key.into(),
            my_segments,
            readiness,
            metrics: SyncMetrics::new(),
        }
    }
}

#[async_trait]
impl TaskJob for MySegmentsUpdater {
    fn name(&self) -> &str {
        "my_segments"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let start = Instant::now();
        let names = match self.fetcher.fetch_my_segments(&self.key).await {
            Ok(names) => names,
            Err(e) => {
                self.metrics.inc_fetch_errors("my_segments");
                return Err(e).with_context(|| format!("Failed to fetch segments of key {}", self.key));
            }
        };
        self.metrics
            .observe_fetch_latency("my_segments", start.elapsed().as_secs_f64());

        let changed = self.my_segments.reset_segments(&names);
        if changed || !self.readiness.segments_arrived() {
            self.readiness.on_segments_arrived();
        }
        Ok(())
    }
}

/// Server side: fetches changes of every registered segment
pub struct SegmentChangesUpdater {
    fetcher: Arc<dyn DataFetcher>,
    segments: Arc<SegmentsCache>,
    readiness: Arc<ReadinessManager>,
    metrics: SyncMetrics,
}

impl SegmentChangesUpdater {
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        segments: Arc<SegmentsCache>,
        readiness: Arc<ReadinessManager>,
    ) -> Self {
        Self {
            fetcher,
            segments,
            readiness,
            metrics: SyncMetrics::new(),
        }
    }

    async fn update_segment(&self, name: &str) -> anyhow::Result<bool> {
        let mut changed = false;
        loop {
            let since = self.segments.get_change_number(name);
            let start = Instant::now();
            let changes = match self.fetcher.fetch_segment_changes(name, since).await {
                Ok(changes) => changes,
                Err(e) => {
                    self.metrics.inc_fetch_errors("segments");
                    return Err(e).with_context(|| format!("Failed to fetch segment {name}"));
                }
            };
            self.metrics
                .observe_fetch_latency("segments", start.elapsed().as_secs_f64());

            changed |= !changes.added.is_empty() || !changes.removed.is_empty();
            self.segments.add_to_segment(name, &changes.added);
            self.segments.remove_from_segment(name, &changes.removed);
            self.segments.set_change_number(name, changes.till);

            if changes.till <= since {
                return Ok(changed);
            }
        }
    }
}

#[async_trait]
impl TaskJob for SegmentChangesUpdater {
    fn name(&self) -> &str {
        "segment_changes"
    }

    async fn run(&self) -> anyhow::Result<()> {
        let mut changed = false;
        for name in self.segments.get_registered_segments() {
            changed |= self.update_segment(&name).await?;
        }
        if changed || !self.readiness.segments_arrived() {
            self.readiness.on_segments_arrived();
        }
        Ok(())
    }
}

/// Owns the periodic flags task and the segments tasks
pub struct PollingManager {
    fetcher: Arc<dyn DataFetcher>,
    splits_task: SyncTask,
    /// Server-side segments task, absent on client side
    segments_task: Option<SyncTask>,
    /// Client-side segments tasks, one per matching key
    my_segments_tasks: DashMap<String, SyncTask>,
    segments_refresh: Duration,
}

impl PollingManager {
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        splits: Arc<SplitsCache>,
        segments: Arc<SegmentsCache>,
        readiness: Arc<ReadinessManager>,
        client_side: bool,
        features_refresh: Duration,
        segments_refresh: Duration,
    ) -> Self {
        let splits_job = SplitChangesUpdater::new(
            fetcher.clone(),
            splits,
            (!client_side).then(|| segments.clone()),
            readiness.clone(),
        );
        let segments_task = (!client_side).then(|| {
            SyncTask::new(
                Arc::new(SegmentChangesUpdater::new(fetcher.clone(), segments, readiness)),
                segments_refresh,
            )
        });

        Self {
            splits_task: SyncTask::new(Arc::new(splits_job), features_refresh),
            fetcher,
            segments_task,
            my_segments_tasks: DashMap::new(),
            segments_refresh,
        }
    }

    pub fn start(&self) {
        info!("Starting polling");
        self.splits_task.start(None);
        if let Some(task) = &self.segments_task {
            task.start(None);
        }
        for task in self.my_segments_tasks.iter() {
            task.value().start(None);
        }
    }

    pub fn stop(&self) {
        info!("Stopping polling");
        self.splits_task.stop();
        if let Some(task) = &self.segments_task {
            task.stop();
        }
        for task in self.my_segments_tasks.iter() {
            task.value().stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.splits_task.is_running()
    }

    /// Fetches flags, then every segment source, once
    pub async fn sync_all(&self) {
        self.splits_task.execute_now().await;
        if let Some(task) = &self.segments_task {
            task.execute_now().await;
        }
        let tasks: Vec<SyncTask> = self
            .my_segments_tasks
            .iter()
            .map(|t| t.value().clone())
            .collect();
        for task in tasks {
            task.execute_now().await;
        }
    }

    /// Registers the segments task of a matching key (not started)
    pub fn add(
        &self,
        key: &str,
        my_segments: Arc<MySegmentsCache>,
        readiness: Arc<ReadinessManager>,
    ) -> SyncTask {
        let job = MySegmentsUpdater::new(self.fetcher.clone(), key, my_segments, readiness);
        let task = SyncTask::new(Arc::new(job), self.segments_refresh);
        if let Some(previous) = self.my_segments_tasks.insert(key.to_string(), task.clone()) {
            previous.stop();
        }
        task
    }

    pub fn remove(&self, key: &str) -> Option<SyncTask> {
        let (_, task) = self.my_segments_tasks.remove(key)?;
        task.stop();
        Some(task)
    }

    pub fn get(&self, key: &str) -> Option<SyncTask> {
        self.my_segments_tasks.get(key).map(|t| t.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::{SegmentChanges, SplitChanges};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFetcher {
        pages: Mutex<Vec<SplitChanges>>,
        my_segments: Mutex<Vec<String>>,
        segment_changes: Mutex<Vec<SegmentChanges>>,
    }

    #[async_trait]
    impl DataFetcher for FakeFetcher {
        async fn fetch_split_changes(&self, since: i64) -> anyhow::Result<SplitChanges> {
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(SplitChanges {
                    splits: Vec::new(),
                    since,
                    till: since,
                });
            }
            Ok(pages.remove(0))
        }

        async fn fetch_my_segments(&self, _key: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.my_segments.lock().unwrap().clone())
        }

        async fn fetch_segment_changes(&self, name: &str, since: i64) -> anyhow::Result<SegmentChanges> {
            let mut pages = self.segment_changes.lock().unwrap();
            if pages.is_empty() {
                return Ok(SegmentChanges {
                    name: name.to_string(),
                    since,
                    till: since,
                    ..Default::default()
                });
            }
            Ok(pages.remove(0))
        }
    }

    #[tokio::test]
    async fn test_split_updater_applies_pages_until_caught_up() {
        let fetcher = Arc::new(FakeFetcher::default());
        *fetcher.pages.lock().unwrap() = vec![
            SplitChanges {
                splits: vec![
                    json!({"name": "f1", "status": "ACTIVE", "trafficTypeName": "user"}),
                    json!({"name": "f2", "status": "ACTIVE"}),
                    json!({"status": "ACTIVE"}),
                ],
                since: -1,
                till: 10,
            },
            SplitChanges {
                splits: vec![json!({"name": "f2", "status": "ARCHIVED"})],
                since: 10,
                till: 20,
            },
        ];
        let splits = Arc::new(SplitsCache::new());
        let readiness = Arc::new(ReadinessManager::new(Duration::ZERO));
        let updater = SplitChangesUpdater::new(fetcher, splits.clone(), None, readiness.clone());

        updater.run().await.unwrap();
        assert_eq!(splits.get_change_number(), 20);
        assert!(splits.get_split("f1").is_some());
        assert!(splits.get_split("f2").is_none());
        assert!(splits.traffic_type_exists("user"));
        assert!(readiness.state().splits_arrived);
    }

    #[tokio::test]
    async fn test_my_segments_updater_signals_segments() {
        let fetcher = Arc::new(FakeFetcher::default());
        *fetcher.my_segments.lock().unwrap() = vec!["beta".to_string()];
        let cache = Arc::new(MySegmentsCache::new());
        let readiness = Arc::new(ReadinessManager::new(Duration::ZERO));
        let updater = MySegmentsUpdater::new(fetcher, "emma", cache.clone(), readiness.clone());

        updater.run().await.unwrap();
        assert!(cache.is_in_segment("beta"));
        assert!(readiness.segments_arrived());
    }

    #[tokio::test]
    async fn test_server_side_segments_follow_registered_names() {
        let fetcher = Arc::new(FakeFetcher::default());
        *fetcher.pages.lock().unwrap() = vec![SplitChanges {
            splits: vec![json!({
                "name": "f1",
                "conditions": [{"matcherGroup": {"matchers": [
                    {"matcherType": "IN_SEGMENT", "userDefinedSegmentMatcherData": {"segmentName": "employees"}}
                ]}}]
            })],
            since: -1,
            till: 5,
        }];
        *fetcher.segment_changes.lock().unwrap() = vec![SegmentChanges {
            name: "employees".to_string(),
            added: vec!["emma".to_string()],
            removed: vec![],
            since: -1,
            till: 3,
        }];

        let splits = Arc::new(SplitsCache::new());
        let segments = Arc::new(SegmentsCache::new());
        let readiness = Arc::new(ReadinessManager::new(Duration::ZERO));
        let polling = PollingManager::new(
            fetcher,
            splits,
            segments.clone(),
            readiness.clone(),
            false,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        polling.sync_all().await;
        assert!(segments.is_in_segment("employees", "emma"));
        assert_eq!(segments.get_change_number("employees"), 3);
        assert!(readiness.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_manager_tasks() {
        let fetcher = Arc::new(FakeFetcher::default());
        let readiness = Arc::new(ReadinessManager::new(Duration::ZERO));
        let polling = PollingManager::new(
            fetcher,
            Arc::new(SplitsCache::new()),
            Arc::new(SegmentsCache::new()),
            readiness.clone(),
            true,
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let task = polling.add("emma", Arc::new(MySegmentsCache::new()), readiness.clone());
        assert!(polling.get("emma").is_some());

        polling.start();
        assert!(polling.is_running());
        assert!(task.is_running());

        polling.stop();
        assert!(!polling.is_running());
        assert!(!task.is_running());

        assert!(polling.remove("emma").is_some());
        assert!(polling.get("emma").is_none());
    }
}
