//! Periodic submitters draining the telemetry caches into the collector

use super::task::{SyncTask, TaskJob};
use super::transport::{Collector, Endpoint};
use crate::models::{EventRecord, ImpressionRecord};
use crate::observability::{StructuredLogger, SyncMetrics};
use crate::settings::Settings;
use crate::storage::{
    EventsCache, ImpressionCountsCache, ImpressionsCache, InMemoryStorage, RecorderCache,
    TelemetryCache, UniqueKeysCache,
};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Encoded batch ready to be posted
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub endpoint: Endpoint,
    pub body: Value,
    pub records: usize,
}

/// A cache seen as a source of wire batches
pub trait BatchSource: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    /// Takes the whole pending content; `None` when there is nothing to send
    fn take(&self) -> Option<Payload>;

    /// Signal fired when the underlying cache reaches its threshold
    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// `[{f, i: [{k, t, m, c, r, b, pt}]}]`, grouped by feature in arrival order
pub fn impressions_payload(batch: &[ImpressionRecord], labels_enabled: bool) -> Value {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<(&str, Vec<Value>)> = Vec::new();

    for impression in batch {
        let mut entry = Map::new();
        entry.insert("k".into(), json!(impression.key_name));
        entry.insert("t".into(), json!(impression.treatment));
        entry.insert("m".into(), json!(impression.time));
        entry.insert("c".into(), json!(impression.change_number));
        if labels_enabled {
            if let Some(label) = &impression.label {
                entry.insert("r".into(), json!(label));
            }
        }
        if let Some(bucketing_key) = &impression.bucketing_key {
            entry.insert("b".into(), json!(bucketing_key));
        }
        if let Some(previous_time) = impression.previous_time {
            entry.insert("pt".into(), json!(previous_time));
        }

        let slot = *index.entry(impression.feature.as_str()).or_insert_with(|| {
            groups.push((impression.feature.as_str(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(Value::Object(entry));
    }

    Value::Array(
        groups
            .into_iter()
            .map(|(feature, entries)| json!({"f": feature, "i": entries}))
            .collect(),
    )
}

pub fn events_payload(batch: &[EventRecord]) -> Value {
    serde_json::to_value(batch).unwrap_or_else(|_| Value::Array(Vec::new()))
}

/// `{pf: [{f, m, rc}]}`, sorted by feature then hour
pub fn impression_counts_payload(batch: &HashMap<String, u64>) -> Value {
    let mut counts: Vec<(&str, i64, u64)> = batch
        .iter()
        .filter_map(|(key, count)| {
            let (feature, time_frame) = ImpressionCountsCache::parse_key(key)?;
            Some((feature, time_frame, *count))
        })
        .collect();
    counts.sort();

    json!({
        "pf": counts
            .into_iter()
            .map(|(f, m, rc)| json!({"f": f, "m": m, "rc": rc}))
            .collect::<Vec<_>>()
    })
}

struct ImpressionsSource {
    cache: Arc<ImpressionsCache>,
    labels_enabled: bool,
}

impl BatchSource for ImpressionsSource {
    fn kind(&self) -> &'static str {
        Endpoint::Impressions.kind()
    }

    fn take(&self) -> Option<Payload> {
        if self.cache.is_empty() {
            return None;
        }
        let batch = self.cache.pop();
        Some(Payload {
            endpoint: Endpoint::Impressions,
            body: impressions_payload(&batch, self.labels_enabled),
            records: batch.len(),
        })
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        self.cache.full_queue_signal()
    }
}

struct EventsSource {
    cache: Arc<EventsCache>,
}

impl BatchSource for EventsSource {
    fn kind(&self) -> &'static str {
        Endpoint::Events.kind()
    }

    fn take(&self) -> Option<Payload> {
        if self.cache.is_empty() {
            return None;
        }
        let batch = self.cache.pop();
        Some(Payload {
            endpoint: Endpoint::Events,
            body: events_payload(&batch),
            records: batch.len(),
        })
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        self.cache.full_queue_signal()
    }
}

struct ImpressionCountsSource {
    cache: Arc<ImpressionCountsCache>,
}

impl BatchSource for ImpressionCountsSource {
    fn kind(&self) -> &'static str {
        Endpoint::ImpressionCounts.kind()
    }

    fn take(&self) -> Option<Payload> {
        if self.cache.is_empty() {
            return None;
        }
        let batch = self.cache.pop();
        Some(Payload {
            endpoint: Endpoint::ImpressionCounts,
            body: impression_counts_payload(&batch),
            records: batch.len(),
        })
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        self.cache.full_queue_signal()
    }
}

struct UniqueKeysSource {
    cache: Arc<UniqueKeysCache>,
}

impl BatchSource for UniqueKeysSource {
    fn kind(&self) -> &'static str {
        Endpoint::UniqueKeysSs.kind()
    }

    fn take(&self) -> Option<Payload> {
        if self.cache.is_empty() {
            return None;
        }
        let batch = self.cache.pop();
        let endpoint = if self.cache.is_client_side() {
            Endpoint::UniqueKeysCs
        } else {
            Endpoint::UniqueKeysSs
        };
        Some(Payload {
            endpoint,
            body: self.cache.to_payload(&batch),
            // (feature, key) pairs, not groups
            records: batch.iter().map(|(_, members)| members.len()).sum(),
        })
    }

    fn full_queue_signal(&self) -> Option<Arc<Notify>> {
        self.cache.full_queue_signal()
    }
}

struct UsageSource {
    cache: Arc<TelemetryCache>,
}

impl BatchSource for UsageSource {
    fn kind(&self) -> &'static str {
        Endpoint::Usage.kind()
    }

    fn take(&self) -> Option<Payload> {
        if self.cache.is_empty() {
            return None;
        }
        let usage = self.cache.pop();
        let body = serde_json::to_value(&usage).ok()?;
        Some(Payload {
            endpoint: Endpoint::Usage,
            body,
            records: 1,
        })
    }
}

struct SubmitJob {
    source: Arc<dyn BatchSource>,
    collector: Arc<dyn Collector>,
    metrics: SyncMetrics,
    logger: StructuredLogger,
}

#[async_trait]
impl TaskJob for SubmitJob {
    fn name(&self) -> &str {
        self.source.kind()
    }

    async fn run(&self) -> anyhow::Result<()> {
        let Some(payload) = self.source.take() else {
            debug!(kind = self.source.kind(), "Nothing to submit");
            return Ok(());
        };
        let kind = payload.endpoint.kind();
        let body = serde_json::to_string(&payload.body).context("Failed to serialize batch")?;

        match self.collector.post(payload.endpoint, body).await {
            Ok(()) => {
                self.metrics.record_batch(kind, payload.records);
                self.logger.log_batch_submitted(kind, payload.records, true);
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_submit_errors(kind);
                self.logger.log_batch_submitted(kind, payload.records, false);
                Err(e).with_context(|| format!("Failed to post {kind} batch"))
            }
        }
    }
}

/// Drains one telemetry cache on a schedule, or right away when it fills up
#[derive(Clone)]
pub struct Submitter {
    source: Arc<dyn BatchSource>,
    task: SyncTask,
    first_push_window: Option<Duration>,
}

impl Submitter {
    pub fn new(
        source: Arc<dyn BatchSource>,
        collector: Arc<dyn Collector>,
        period: Duration,
        first_push_window: Option<Duration>,
    ) -> Self {
        let job = SubmitJob {
            source: source.clone(),
            collector,
            metrics: SyncMetrics::new(),
            logger: StructuredLogger::new(source.kind()),
        };
        let task = SyncTask::with_trigger(Arc::new(job), period, source.full_queue_signal());
        Self {
            source,
            task,
            first_push_window: first_push_window.filter(|w| !w.is_zero()),
        }
    }

    pub fn impressions(
        cache: Arc<ImpressionsCache>,
        labels_enabled: bool,
        collector: Arc<dyn Collector>,
        period: Duration,
    ) -> Self {
        let source = ImpressionsSource {
            cache,
            labels_enabled,
        };
        Self::new(Arc::new(source), collector, period, None)
    }

    pub fn events(
        cache: Arc<EventsCache>,
        collector: Arc<dyn Collector>,
        period: Duration,
        first_push_window: Duration,
    ) -> Self {
        Self::new(
            Arc::new(EventsSource { cache }),
            collector,
            period,
            Some(first_push_window),
        )
    }

    pub fn impression_counts(
        cache: Arc<ImpressionCountsCache>,
        collector: Arc<dyn Collector>,
        period: Duration,
    ) -> Self {
        Self::new(Arc::new(ImpressionCountsSource { cache }), collector, period, None)
    }

    pub fn unique_keys(
        cache: Arc<UniqueKeysCache>,
        collector: Arc<dyn Collector>,
        period: Duration,
    ) -> Self {
        Self::new(Arc::new(UniqueKeysSource { cache }), collector, period, None)
    }

    pub fn usage(cache: Arc<TelemetryCache>, collector: Arc<dyn Collector>, period: Duration) -> Self {
        Self::new(Arc::new(UsageSource { cache }), collector, period, None)
    }

    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }

    pub fn source(&self) -> Arc<dyn BatchSource> {
        self.source.clone()
    }

    /// Flushes right away, or after the first push window when one is set
    pub fn start(&self) {
        self.task.start(self.first_push_window);
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    pub fn is_executing(&self) -> bool {
        self.task.is_executing()
    }

    /// Flushes in the background unless a flush is in flight
    pub fn execute(&self) -> Option<JoinHandle<()>> {
        self.task.execute()
    }

    pub async fn flush(&self) -> bool {
        self.task.execute_now().await
    }
}

/// Every submitter of a storage, with usage telemetry kept apart so it can
/// run without user consent
pub struct SubmitterManager {
    submitters: Vec<Submitter>,
    usage: Option<Submitter>,
}

impl SubmitterManager {
    pub fn new(settings: &Settings, storage: &InMemoryStorage, collector: Arc<dyn Collector>) -> Self {
        let scheduler = &settings.scheduler;
        let secs = Duration::from_secs;

        let mut submitters = vec![
            Submitter::impressions(
                storage.impressions.clone(),
                settings.core.labels_enabled,
                collector.clone(),
                secs(scheduler.impressions_refresh_rate),
            ),
            Submitter::events(
                storage.events.clone(),
                collector.clone(),
                secs(scheduler.events_push_rate),
                settings.events_first_push_window(),
            ),
        ];
        if let Some(counts) = &storage.impression_counts {
            submitters.push(Submitter::impression_counts(
                counts.clone(),
                collector.clone(),
                secs(scheduler.impression_counts_refresh_rate),
            ));
        }
        if let Some(unique_keys) = &storage.unique_keys {
            submitters.push(Submitter::unique_keys(
                unique_keys.clone(),
                collector.clone(),
                secs(scheduler.unique_keys_refresh_rate),
            ));
        }
        let usage = storage.telemetry.as_ref().map(|telemetry| {
            Submitter::usage(
                telemetry.clone(),
                collector,
                secs(scheduler.telemetry_refresh_rate),
            )
        });

        Self { submitters, usage }
    }

    fn selected(&self, only_usage: bool) -> impl Iterator<Item = &Submitter> {
        self.submitters
            .iter()
            .filter(move |_| !only_usage)
            .chain(self.usage.iter())
    }

    /// Starts the submitters; `only_usage` leaves user data untouched
    pub fn start(&self, only_usage: bool) {
        for submitter in self.selected(only_usage) {
            submitter.start();
        }
    }

    pub fn stop(&self) {
        for submitter in self.selected(false) {
            submitter.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.selected(false).any(Submitter::is_running)
    }

    pub fn is_executing(&self) -> bool {
        self.selected(false).any(Submitter::is_executing)
    }

    /// Sources for a best-effort flush outside the schedule
    pub fn sources(&self, only_usage: bool) -> Vec<Arc<dyn BatchSource>> {
        self.selected(only_usage).map(Submitter::source).collect()
    }

    /// Flushes every selected submitter and waits for the posts
    pub async fn flush(&self, only_usage: bool) {
        let handles: Vec<_> = self
            .selected(only_usage)
            .filter_map(Submitter::execute)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn get(&self, kind: &str) -> Option<&Submitter> {
        self.selected(false).find(|s| s.kind() == kind)
    }
}
