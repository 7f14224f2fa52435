//! Storage backed by a user-provided key-value wrapper
//!
//! The wrapper is validated when the storage is built: a missing wrapper or
//! one lacking any required primitive fails immediately with a
//! [`StorageError`] naming what is missing.

use crate::error::StorageError;
use crate::keys::{validate_prefix, KeyBuilder};
use crate::models::{EventRecord, FlagRecord, ImpressionRecord};
use crate::readiness::ReadinessManager;
use crate::util::lock;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Primitives a wrapper must provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrapperMethod {
    Get,
    Set,
    GetAndSet,
    Del,
    GetKeysByPrefix,
    GetMany,
    Incr,
    Decr,
    PushItems,
    PopItems,
    GetItemsCount,
    ItemContains,
    AddItems,
    RemoveItems,
    GetItems,
    Connect,
    Close,
}

impl WrapperMethod {
    pub const REQUIRED: [WrapperMethod; 17] = [
        Self::Get,
        Self::Set,
        Self::GetAndSet,
        Self::Del,
        Self::GetKeysByPrefix,
        Self::GetMany,
        Self::Incr,
        Self::Decr,
        Self::PushItems,
        Self::PopItems,
        Self::GetItemsCount,
        Self::ItemContains,
        Self::AddItems,
        Self::RemoveItems,
        Self::GetItems,
        Self::Connect,
        Self::Close,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::GetAndSet => "getAndSet",
            Self::Del => "del",
            Self::GetKeysByPrefix => "getKeysByPrefix",
            Self::GetMany => "getMany",
            Self::Incr => "incr",
            Self::Decr => "decr",
            Self::PushItems => "pushItems",
            Self::PopItems => "popItems",
            Self::GetItemsCount => "getItemsCount",
            Self::ItemContains => "itemContains",
            Self::AddItems => "addItems",
            Self::RemoveItems => "removeItems",
            Self::GetItems => "getItems",
            Self::Connect => "connect",
            Self::Close => "close",
        }
    }
}

pub type WrapperResult<T> = Result<T, StorageError>;

/// Key-value backend contract
///
/// Lists (`push_items`/`pop_items`) are FIFO queues; sets (`add_items`/
/// `remove_items`) hold unique members.
#[async_trait]
pub trait StorageWrapper: Send + Sync {
    /// Whether the wrapper provides `method`. Bridges to dynamically typed
    /// backends report the primitives they could not bind.
    fn supports(&self, _method: WrapperMethod) -> bool {
        true
    }

    async fn get(&self, key: &str) -> WrapperResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> WrapperResult<bool>;
    async fn get_and_set(&self, key: &str, value: &str) -> WrapperResult<Option<String>>;
    async fn del(&self, key: &str) -> WrapperResult<bool>;
    async fn get_keys_by_prefix(&self, prefix: &str) -> WrapperResult<Vec<String>>;
    async fn get_many(&self, keys: &[String]) -> WrapperResult<Vec<Option<String>>>;
    async fn incr(&self, key: &str, delta: i64) -> WrapperResult<i64>;
    async fn decr(&self, key: &str, delta: i64) -> WrapperResult<i64>;
    async fn push_items(&self, key: &str, items: &[String]) -> WrapperResult<()>;
    async fn pop_items(&self, key: &str, count: usize) -> WrapperResult<Vec<String>>;
    async fn get_items_count(&self, key: &str) -> WrapperResult<usize>;
    async fn item_contains(&self, key: &str, item: &str) -> WrapperResult<bool>;
    async fn add_items(&self, key: &str, items: &[String]) -> WrapperResult<()>;
    async fn remove_items(&self, key: &str, items: &[String]) -> WrapperResult<()>;
    async fn get_items(&self, key: &str) -> WrapperResult<Vec<String>>;
    async fn connect(&self) -> WrapperResult<()>;
    async fn close(&self) -> WrapperResult<()>;
}

/// Options of [`PluggableStorage::new`]
#[derive(Clone, Default)]
pub struct PluggableStorageOptions {
    pub prefix: Option<String>,
    pub wrapper: Option<Arc<dyn StorageWrapper>>,
}

fn validate_wrapper(options: &PluggableStorageOptions) -> Result<Arc<dyn StorageWrapper>, StorageError> {
    let wrapper = options.wrapper.clone().ok_or(StorageError::MissingWrapper)?;
    let missing: Vec<&'static str> = WrapperMethod::REQUIRED
        .iter()
        .filter(|m| !wrapper.supports(**m))
        .map(|m| m.name())
        .collect();
    if !missing.is_empty() {
        return Err(StorageError::MissingMethods(missing));
    }
    Ok(wrapper)
}

/// Consumer-mode storage reading flags and segments from a shared backend
/// and pushing impressions and events into it
#[derive(Clone)]
pub struct PluggableStorage {
    keys: KeyBuilder,
    wrapper: Arc<dyn StorageWrapper>,
    shared: bool,
}

impl std::fmt::Debug for PluggableStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluggableStorage")
            .field("prefix", &self.keys.prefix())
            .field("shared", &self.shared)
            .finish()
    }
}

impl PluggableStorage {
    pub fn new(options: PluggableStorageOptions) -> Result<Self, StorageError> {
        let wrapper = validate_wrapper(&options)?;
        let prefix = validate_prefix(options.prefix.as_deref());
        Ok(Self {
            keys: KeyBuilder::new(prefix),
            wrapper,
            shared: false,
        })
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Connects the wrapper in the background.
    ///
    /// Data in the backend is maintained by an external synchronizer, so a
    /// successful connection is all it takes for the gate to become ready.
    pub fn connect(&self, readiness: Arc<ReadinessManager>) -> JoinHandle<()> {
        let wrapper = self.wrapper.clone();
        tokio::spawn(async move {
            match wrapper.connect().await {
                Ok(()) => {
                    info!("Storage wrapper connected");
                    readiness.on_splits_arrived(false);
                    readiness.on_segments_arrived();
                }
                Err(e) => error!(error = %e, "Error connecting storage wrapper"),
            }
        })
    }

    /// View for another matching key; reconnects to signal its own gate and
    /// never closes the wrapper on destroy
    pub fn shared(&self, readiness: Arc<ReadinessManager>) -> (Self, JoinHandle<()>) {
        let view = Self {
            shared: true,
            ..self.clone()
        };
        let connecting = view.connect(readiness);
        (view, connecting)
    }

    /// Closes the wrapper; a no-op on shared views
    pub async fn destroy(&self) -> WrapperResult<()> {
        if self.shared {
            return Ok(());
        }
        self.wrapper.close().await
    }

    pub async fn get_split(&self, name: &str) -> WrapperResult<Option<FlagRecord>> {
        let raw = self.wrapper.get(&self.keys.build_split_key(name)).await?;
        Ok(raw.and_then(|definition| parse_flag(name, &definition)))
    }

    pub async fn get_splits(&self, names: &[String]) -> WrapperResult<HashMap<String, Option<FlagRecord>>> {
        let keys: Vec<String> = names.iter().map(|n| self.keys.build_split_key(n)).collect();
        let values = self.wrapper.get_many(&keys).await?;
        Ok(names
            .iter()
            .zip(values)
            .map(|(name, raw)| {
                let flag = raw.and_then(|definition| parse_flag(name, &definition));
                (name.clone(), flag)
            })
            .collect())
    }

    pub async fn get_split_names(&self) -> WrapperResult<Vec<String>> {
        let keys = self
            .wrapper
            .get_keys_by_prefix(&self.keys.build_split_key_prefix())
            .await?;
        Ok(keys
            .iter()
            .filter_map(|k| self.keys.extract_key(k).ok())
            .collect())
    }

    /// -1 when the backend has no change number or an unparseable one
    pub async fn get_change_number(&self) -> WrapperResult<i64> {
        let raw = self.wrapper.get(&self.keys.build_splits_till_key()).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(-1))
    }

    pub async fn traffic_type_exists(&self, traffic_type: &str) -> WrapperResult<bool> {
        let raw = self
            .wrapper
            .get(&self.keys.build_traffic_type_key(traffic_type))
            .await?;
        Ok(raw.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) > 0)
    }

    pub async fn is_in_segment(&self, name: &str, key: &str) -> WrapperResult<bool> {
        self.wrapper
            .item_contains(&self.keys.build_segment_name_key(name), key)
            .await
    }

    pub async fn get_segment_change_number(&self, name: &str) -> WrapperResult<i64> {
        let raw = self.wrapper.get(&self.keys.build_segment_till_key(name)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(-1))
    }

    /// Pushes impressions as JSON items onto `<prefix>.impressions`
    pub async fn track_impressions(&self, impressions: &[ImpressionRecord]) -> WrapperResult<bool> {
        let items = to_json_items(impressions)?;
        self.wrapper
            .push_items(&self.keys.build_impressions_key(), &items)
            .await?;
        Ok(true)
    }

    /// Pushes one event as a JSON item onto `<prefix>.events`
    pub async fn track_event(&self, event: &EventRecord) -> WrapperResult<bool> {
        let items = to_json_items(std::slice::from_ref(event))?;
        self.wrapper
            .push_items(&self.keys.build_events_key(), &items)
            .await?;
        Ok(true)
    }
}

fn parse_flag(name: &str, definition: &str) -> Option<FlagRecord> {
    match FlagRecord::parse(name, definition) {
        Ok(flag) => Some(flag),
        Err(e) => {
            warn!(flag = %name, error = %e, "Skipping unparseable flag definition");
            None
        }
    }
}

fn to_json_items<T: serde::Serialize>(records: &[T]) -> WrapperResult<Vec<String>> {
    records
        .iter()
        .map(|r| {
            serde_json::to_string(r).map_err(|e| StorageError::Wrapper {
                operation: WrapperMethod::PushItems.name(),
                message: e.to_string(),
            })
        })
        .collect()
}

#[derive(Default)]
struct MemoryData {
    values: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    connected: bool,
}

/// Process-local [`StorageWrapper`], handy for consumer mode in tests and
/// single-process deployments
#[derive(Default)]
pub struct InMemoryWrapper {
    data: Mutex<MemoryData>,
}

impl InMemoryWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.data).connected
    }

    fn add_to_counter(&self, key: &str, delta: i64) -> WrapperResult<i64> {
        let mut data = lock(&self.data);
        let current = match data.values.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|e| StorageError::Wrapper {
                operation: WrapperMethod::Incr.name(),
                message: e.to_string(),
            })?,
            None => 0,
        };
        let next = current + delta;
        data.values.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

#[async_trait]
impl StorageWrapper for InMemoryWrapper {
    async fn get(&self, key: &str) -> WrapperResult<Option<String>> {
        Ok(lock(&self.data).values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> WrapperResult<bool> {
        lock(&self.data)
            .values
            .insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn get_and_set(&self, key: &str, value: &str) -> WrapperResult<Option<String>> {
        Ok(lock(&self.data)
            .values
            .insert(key.to_string(), value.to_string()))
    }

    async fn del(&self, key: &str) -> WrapperResult<bool> {
        let mut data = lock(&self.data);
        let removed = data.values.remove(key).is_some()
            | data.lists.remove(key).is_some()
            | data.sets.remove(key).is_some();
        Ok(removed)
    }

    async fn get_keys_by_prefix(&self, prefix: &str) -> WrapperResult<Vec<String>> {
        let data = lock(&self.data);
        let mut keys: Vec<String> = data
            .values
            .keys()
            .chain(data.lists.keys())
            .chain(data.sets.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> WrapperResult<Vec<Option<String>>> {
        let data = lock(&self.data);
        Ok(keys.iter().map(|k| data.values.get(k).cloned()).collect())
    }

    async fn incr(&self, key: &str, delta: i64) -> WrapperResult<i64> {
        self.add_to_counter(key, delta)
    }

    async fn decr(&self, key: &str, delta: i64) -> WrapperResult<i64> {
        self.add_to_counter(key, -delta)
    }

    async fn push_items(&self, key: &str, items: &[String]) -> WrapperResult<()> {
        lock(&self.data)
            .lists
            .entry(key.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn pop_items(&self, key: &str, count: usize) -> WrapperResult<Vec<String>> {
        let mut data = lock(&self.data);
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(Vec::new());
        };
        let n = count.min(list.len());
        Ok(list.drain(..n).collect())
    }

    async fn get_items_count(&self, key: &str) -> WrapperResult<usize> {
        Ok(lock(&self.data).lists.get(key).map(VecDeque::len).unwrap_or(0))
    }

    async fn item_contains(&self, key: &str, item: &str) -> WrapperResult<bool> {
        Ok(lock(&self.data)
            .sets
            .get(key)
            .map(|s| s.contains(item))
            .unwrap_or(false))
    }

    async fn add_items(&self, key: &str, items: &[String]) -> WrapperResult<()> {
        lock(&self.data)
            .sets
            .entry(key.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn remove_items(&self, key: &str, items: &[String]) -> WrapperResult<()> {
        if let Some(set) = lock(&self.data).sets.get_mut(key) {
            for item in items {
                set.remove(item);
            }
        }
        Ok(())
    }

    async fn get_items(&self, key: &str) -> WrapperResult<Vec<String>> {
        let mut items: Vec<String> = lock(&self.data)
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        items.sort();
        Ok(items)
    }

    async fn connect(&self) -> WrapperResult<()> {
        lock(&self.data).connected = true;
        Ok(())
    }

    async fn close(&self) -> WrapperResult<()> {
        lock(&self.data).connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Wrapper that could not bind some primitives
    struct PartialWrapper {
        inner: InMemoryWrapper,
        missing: Vec<WrapperMethod>,
    }

    #[async_trait]
    impl StorageWrapper for PartialWrapper {
        fn supports(&self, method: WrapperMethod) -> bool {
            !self.missing.contains(&method)
        }
        async fn get(&self, key: &str) -> WrapperResult<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> WrapperResult<bool> {
            self.inner.set(key, value).await
        }
        async fn get_and_set(&self, key: &str, value: &str) -> WrapperResult<Option<String>> {
            self.inner.get_and_set(key, value).await
        }
        async fn del(&self, key: &str) -> WrapperResult<bool> {
            self.inner.del(key).await
        }
        async fn get_keys_by_prefix(&self, prefix: &str) -> WrapperResult<Vec<String>> {
            self.inner.get_keys_by_prefix(prefix).await
        }
        async fn get_many(&self, keys: &[String]) -> WrapperResult<Vec<Option<String>>> {
            self.inner.get_many(keys).await
        }
        async fn incr(&self, key: &str, delta: i64) -> WrapperResult<i64> {
            self.inner.incr(key, delta).await
        }
        async fn decr(&self, key: &str, delta: i64) -> WrapperResult<i64> {
            self.inner.decr(key, delta).await
        }
        async fn push_items(&self, key: &str, items: &[String]) -> WrapperResult<()> {
            self.inner.push_items(key, items).await
        }
        async fn pop_items(&self, key: &str, count: usize) -> WrapperResult<Vec<String>> {
            self.inner.pop_items(key, count).await
        }
        async fn get_items_count(&self, key: &str) -> WrapperResult<usize> {
            self.inner.get_items_count(key).await
        }
        async fn item_contains(&self, key: &str, item: &str) -> WrapperResult<bool> {
            self.inner.item_contains(key, item).await
        }
        async fn add_items(&self, key: &str, items: &[String]) -> WrapperResult<()> {
            self.inner.add_items(key, items).await
        }
        async fn remove_items(&self, key: &str, items: &[String]) -> WrapperResult<()> {
            self.inner.remove_items(key, items).await
        }
        async fn get_items(&self, key: &str) -> WrapperResult<Vec<String>> {
            self.inner.get_items(key).await
        }
        async fn connect(&self) -> WrapperResult<()> {
            Err(StorageError::Wrapper {
                operation: "connect",
                message: "refused".to_string(),
            })
        }
        async fn close(&self) -> WrapperResult<()> {
            self.inner.close().await
        }
    }

    fn storage_with(wrapper: Arc<dyn StorageWrapper>) -> PluggableStorage {
        PluggableStorage::new(PluggableStorageOptions {
            prefix: None,
            wrapper: Some(wrapper),
        })
        .unwrap()
    }

    #[test]
    fn test_missing_wrapper_fails_fast() {
        let err = PluggableStorage::new(PluggableStorageOptions::default()).unwrap_err();
        assert!(matches!(err, StorageError::MissingWrapper));
    }

    #[test]
    fn test_missing_methods_are_named() {
        let wrapper = PartialWrapper {
            inner: InMemoryWrapper::new(),
            missing: vec![WrapperMethod::GetAndSet, WrapperMethod::PopItems],
        };
        let err = PluggableStorage::new(PluggableStorageOptions {
            prefix: Some("app".to_string()),
            wrapper: Some(Arc::new(wrapper)),
        })
        .unwrap_err();

        match &err {
            StorageError::MissingMethods(methods) => {
                assert_eq!(methods, &vec!["getAndSet", "popItems"])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().ends_with("getAndSet,popItems"));
    }

    #[test]
    fn test_empty_prefix_falls_back_to_default() {
        let storage = PluggableStorage::new(PluggableStorageOptions {
            prefix: Some(String::new()),
            wrapper: Some(Arc::new(InMemoryWrapper::new())),
        })
        .unwrap();
        assert_eq!(storage.keys().prefix(), crate::keys::DEFAULT_PREFIX);
    }

    #[tokio::test]
    async fn test_connect_signals_ready() {
        let wrapper = Arc::new(InMemoryWrapper::new());
        let storage = storage_with(wrapper.clone());
        let readiness = Arc::new(ReadinessManager::new(Duration::ZERO));

        storage.connect(readiness.clone()).await.unwrap();
        assert!(wrapper.is_connected());
        assert!(readiness.is_ready());

        let shared_gate = Arc::new(readiness.shared(Duration::ZERO));
        let (shared, connecting) = storage.shared(shared_gate.clone());
        connecting.await.unwrap();
        assert!(shared_gate.is_ready());

        // Shared views never close the wrapper
        shared.destroy().await.unwrap();
        assert!(wrapper.is_connected());
        storage.destroy().await.unwrap();
        assert!(!wrapper.is_connected());
    }

    #[tokio::test]
    async fn test_connect_error_keeps_gate_pending() {
        let wrapper = PartialWrapper {
            inner: InMemoryWrapper::new(),
            missing: Vec::new(),
        };
        let storage = storage_with(Arc::new(wrapper));
        let readiness = Arc::new(ReadinessManager::new(Duration::ZERO));

        storage.connect(readiness.clone()).await.unwrap();
        assert!(!readiness.is_ready());
    }

    #[tokio::test]
    async fn test_reads_use_namespaced_keys() {
        let wrapper = Arc::new(InMemoryWrapper::new());
        let storage = storage_with(wrapper.clone());

        wrapper
            .set("SPLITIO.split.f1", r#"{"trafficTypeName": "user"}"#)
            .await
            .unwrap();
        wrapper.set("SPLITIO.splits.till", "42").await.unwrap();
        wrapper.incr("SPLITIO.trafficType.user", 1).await.unwrap();
        wrapper
            .add_items("SPLITIO.segment.beta", &["emma".to_string()])
            .await
            .unwrap();

        let flag = storage.get_split("f1").await.unwrap().unwrap();
        assert_eq!(flag.traffic_type_name.as_deref(), Some("user"));
        assert_eq!(storage.get_split_names().await.unwrap(), vec!["f1"]);
        assert_eq!(storage.get_change_number().await.unwrap(), 42);
        assert!(storage.traffic_type_exists("user").await.unwrap());
        assert!(!storage.traffic_type_exists("account").await.unwrap());
        assert!(storage.is_in_segment("beta", "emma").await.unwrap());

        let splits = storage
            .get_splits(&["f1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert!(splits["f1"].is_some());
        assert!(splits["missing"].is_none());
    }

    #[tokio::test]
    async fn test_track_pushes_json_items() {
        let wrapper = Arc::new(InMemoryWrapper::new());
        let storage = storage_with(wrapper.clone());

        let event = EventRecord {
            event_type_id: "checkout".to_string(),
            traffic_type_name: "user".to_string(),
            value: Some(1.0),
            timestamp: 1000,
            key: "emma".to_string(),
            properties: None,
        };
        assert!(storage.track_event(&event).await.unwrap());

        let items = wrapper.pop_items("SPLITIO.events", 10).await.unwrap();
        assert_eq!(items.len(), 1);
        let stored: EventRecord = serde_json::from_str(&items[0]).unwrap();
        assert_eq!(stored, event);
    }
}
