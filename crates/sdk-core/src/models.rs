//! Core data models for flag synchronization and telemetry

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Treatment served when a flag has no usable default
pub const CONTROL_TREATMENT: &str = "control";

/// Matcher type referencing a segment
pub const IN_SEGMENT_MATCHER: &str = "IN_SEGMENT";

/// Lifecycle status of a flag definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlagStatus {
    #[default]
    Active,
    Archived,
}

/// Segment reference inside a matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMatcherData {
    #[serde(default)]
    pub segment_name: String,
}

/// Single targeting matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Matcher {
    #[serde(default)]
    pub matcher_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_defined_segment_matcher_data: Option<SegmentMatcherData>,
    #[serde(default)]
    pub negate: bool,
}

/// Group of matchers combined with a single combiner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatcherGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combiner: Option<String>,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

/// Treatment allocation within a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    pub treatment: String,
    pub size: u32,
}

/// Targeting rule of a flag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_type: Option<String>,
    #[serde(default)]
    pub matcher_group: MatcherGroup,
    #[serde(default)]
    pub partitions: Vec<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Feature flag definition as stored by the flags cache
///
/// Every field but `name` is optional on the wire; missing values fall back
/// to safe defaults instead of rejecting the whole update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRecord {
    pub name: String,
    #[serde(default = "default_change_number")]
    pub change_number: i64,
    #[serde(default)]
    pub status: FlagStatus,
    #[serde(default)]
    pub killed: bool,
    #[serde(default = "default_treatment")]
    pub default_treatment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_type_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_allocation: Option<u32>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configurations: Option<HashMap<String, String>>,
}

fn default_change_number() -> i64 {
    -1
}

fn default_treatment() -> String {
    CONTROL_TREATMENT.to_string()
}

impl FlagRecord {
    /// Minimal active definition with no targeting rules
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            change_number: default_change_number(),
            status: FlagStatus::Active,
            killed: false,
            default_treatment: default_treatment(),
            traffic_type_name: None,
            traffic_allocation: None,
            conditions: Vec::new(),
            configurations: None,
        }
    }

    /// Parse a serialized definition stored under `name`.
    ///
    /// The stored name wins over any name in the payload, so `'{}'` is a valid
    /// (if empty) definition.
    pub fn parse(name: &str, definition: &str) -> serde_json::Result<Self> {
        let mut value: serde_json::Value = serde_json::from_str(definition)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("name".to_string(), serde_json::Value::from(name));
        }
        serde_json::from_value(value)
    }

    /// Serialized definition
    pub fn definition(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Names of the segments referenced by this flag's matchers
    pub fn segment_names(&self) -> BTreeSet<String> {
        self.conditions
            .iter()
            .flat_map(|c| c.matcher_group.matchers.iter())
            .filter(|m| m.matcher_type == IN_SEGMENT_MATCHER)
            .filter_map(|m| m.user_defined_segment_matcher_data.as_ref())
            .map(|d| d.segment_name.clone())
            .collect()
    }

    pub fn uses_segments(&self) -> bool {
        self.conditions
            .iter()
            .flat_map(|c| c.matcher_group.matchers.iter())
            .any(|m| m.matcher_type == IN_SEGMENT_MATCHER)
    }
}

/// Named, versioned set of member keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    pub name: String,
    pub keys: BTreeSet<String>,
    pub change_number: i64,
}

impl SegmentRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: BTreeSet::new(),
            change_number: -1,
        }
    }
}

/// Outcome of one evaluation, kept for analytics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionRecord {
    pub feature: String,
    pub key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucketing_key: Option<String>,
    pub treatment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Evaluation time in epoch milliseconds
    pub time: i64,
    pub change_number: i64,
    /// Time of the previous identical impression, when deduplicating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_time: Option<i64>,
}

/// Custom event tracked by the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_type_id: String,
    pub traffic_type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Event time in epoch milliseconds
    pub timestamp: i64,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Map<String, serde_json::Value>>,
}
