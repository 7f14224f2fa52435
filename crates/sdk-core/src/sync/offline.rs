//! In-process flag source for localhost mode

use super::transport::{DataFetcher, SegmentChanges, SplitChanges};
use crate::util::lock;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

/// Traffic type of flags that do not name one
const LOCALHOST_TRAFFIC_TYPE: &str = "localhost";

/// Definition of a local flag: a bare treatment or a treatment with extras
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum LocalFlag {
    Treatment(String),
    Detailed {
        treatment: String,
        #[serde(default)]
        config: Option<String>,
        #[serde(default, rename = "trafficType")]
        traffic_type: Option<String>,
    },
}

impl LocalFlag {
    fn treatment(&self) -> &str {
        match self {
            Self::Treatment(treatment) | Self::Detailed { treatment, .. } => treatment,
        }
    }

    fn to_definition(&self, name: &str, change_number: i64) -> Value {
        let treatment = self.treatment();
        let (config, traffic_type) = match self {
            Self::Treatment(_) => (None, None),
            Self::Detailed {
                config,
                traffic_type,
                ..
            } => (config.as_deref(), traffic_type.as_deref()),
        };

        let mut definition = json!({
            "name": name,
            "changeNumber": change_number,
            "status": "ACTIVE",
            "killed": false,
            "defaultTreatment": treatment,
            "trafficTypeName": traffic_type.unwrap_or(LOCALHOST_TRAFFIC_TYPE),
            "trafficAllocation": 100,
            "conditions": [{
                "conditionType": "ROLLOUT",
                "matcherGroup": {
                    "combiner": "AND",
                    "matchers": [{"matcherType": "ALL_KEYS", "negate": false}]
                },
                "partitions": [{"treatment": treatment, "size": 100}],
                "label": "default rule"
            }]
        });
        if let Some(config) = config {
            definition["configurations"] = json!({ treatment: config });
        }
        definition
    }
}

#[derive(Debug, Default)]
struct LocalState {
    flags: BTreeMap<String, LocalFlag>,
    /// Names handed out by the last non-empty fetch
    served: BTreeSet<String>,
    version: i64,
}

/// Serves a fixed flag map as if it came from the flags endpoint.
///
/// Every [`LocalhostFetcher::update`] bumps the version; flags missing from
/// the new map come back as archived so they leave the cache. Segment
/// queries always answer empty, so segments arrive on the first fetch only.
#[derive(Debug, Default)]
pub struct LocalhostFetcher {
    state: Mutex<LocalState>,
}

impl LocalhostFetcher {
    pub fn new(flags: BTreeMap<String, LocalFlag>) -> Self {
        Self {
            state: Mutex::new(LocalState {
                flags,
                served: BTreeSet::new(),
                version: 1,
            }),
        }
    }

    /// Parses a JSON object of `name -> treatment | {treatment, config, trafficType}`
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::from_str(raw)?))
    }

    pub fn update(&self, flags: BTreeMap<String, LocalFlag>) {
        let mut state = lock(&self.state);
        state.flags = flags;
        state.version += 1;
    }

    pub fn version(&self) -> i64 {
        lock(&self.state).version
    }
}

#[async_trait]
impl DataFetcher for LocalhostFetcher {
    async fn fetch_split_changes(&self, since: i64) -> anyhow::Result<SplitChanges> {
        let mut state = lock(&self.state);
        let version = state.version;
        if since >= version {
            return Ok(SplitChanges {
                splits: Vec::new(),
                since,
                till: since,
            });
        }

        let mut splits: Vec<Value> = state
            .flags
            .iter()
            .map(|(name, flag)| flag.to_definition(name, version))
            .collect();
        let current: BTreeSet<String> = state.flags.keys().cloned().collect();
        splits.extend(state.served.difference(&current).map(|name| {
            json!({"name": name, "changeNumber": version, "status": "ARCHIVED"})
        }));
        state.served = current;

        Ok(SplitChanges {
            splits,
            since,
            till: version,
        })
    }

    async fn fetch_my_segments(&self, _key: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn fetch_segment_changes(&self, name: &str, since: i64) -> anyhow::Result<SegmentChanges> {
        Ok(SegmentChanges {
            name: name.to_string(),
            since,
            till: since,
            ..Default::default()
        })
    }
}
