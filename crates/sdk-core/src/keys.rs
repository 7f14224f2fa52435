//! Namespaced storage keys
//!
//! Builds the `<prefix>.<kind>.<name>` keys used by storage adapters and
//! recovers the trailing segment of a built key.

use crate::error::KeyError;

/// Prefix used when none (or an empty one) is configured
pub const DEFAULT_PREFIX: &str = "SPLITIO";

/// Returns the configured prefix, or the default one when absent or empty
pub fn validate_prefix(prefix: Option<&str>) -> String {
    match prefix {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => DEFAULT_PREFIX.to_string(),
    }
}

/// Builder of namespaced storage keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl KeyBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn build_traffic_type_key(&self, traffic_type: &str) -> String {
        format!("{}.trafficType.{}", self.prefix, traffic_type)
    }

    pub fn build_split_key(&self, split_name: &str) -> String {
        format!("{}.split.{}", self.prefix, split_name)
    }

    pub fn build_splits_till_key(&self) -> String {
        format!("{}.splits.till", self.prefix)
    }

    pub fn build_split_key_prefix(&self) -> String {
        format!("{}.split.", self.prefix)
    }

    pub fn is_split_key(&self, key: &str) -> bool {
        key.starts_with(&self.build_split_key_prefix())
    }

    pub fn build_splits_with_segment_count_key(&self) -> String {
        format!("{}.splits.usingSegments", self.prefix)
    }

    pub fn build_segment_name_key(&self, segment_name: &str) -> String {
        format!("{}.segment.{}", self.prefix, segment_name)
    }

    pub fn build_segment_till_key(&self, segment_name: &str) -> String {
        format!("{}.segment.{}.till", self.prefix, segment_name)
    }

    pub fn build_impressions_key(&self) -> String {
        format!("{}.impressions", self.prefix)
    }

    pub fn build_events_key(&self) -> String {
        format!("{}.events", self.prefix)
    }

    /// Recovers everything after the last dot of a built key.
    ///
    /// Fails when the key is empty or ends with a dot.
    pub fn extract_key(&self, built_key: &str) -> Result<String, KeyError> {
        let tail = built_key.rsplit('.').next().unwrap_or_default();
        if tail.is_empty() {
            return Err(KeyError::InvalidKey(built_key.to_string()));
        }
        Ok(tail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prefix() {
        let keys = KeyBuilder::default();
        assert_eq!(keys.build_split_key("my_flag"), "SPLITIO.split.my_flag");
        assert_eq!(keys.build_splits_till_key(), "SPLITIO.splits.till");
    }

    #[test]
    fn test_key_formats() {
        let keys = KeyBuilder::new("custom");
        assert_eq!(keys.build_traffic_type_key("user"), "custom.trafficType.user");
        assert_eq!(keys.build_segment_name_key("beta"), "custom.segment.beta");
        assert_eq!(keys.build_segment_till_key("beta"), "custom.segment.beta.till");
        assert_eq!(
            keys.build_splits_with_segment_count_key(),
            "custom.splits.usingSegments"
        );
        assert_eq!(keys.build_impressions_key(), "custom.impressions");
        assert_eq!(keys.build_events_key(), "custom.events");
    }

    #[test]
    fn test_is_split_key() {
        let keys = KeyBuilder::default();
        assert!(keys.is_split_key("SPLITIO.split.flag"));
        assert!(!keys.is_split_key("SPLITIO.splits.till"));
        assert!(!keys.is_split_key("OTHER.split.flag"));
    }

    #[test]
    fn test_extract_key() {
        let keys = KeyBuilder::default();
        let built = keys.build_segment_till_key("employees");
        assert_eq!(keys.extract_key(&built).unwrap(), "till");
        assert_eq!(keys.extract_key("SPLITIO.split.flag").unwrap(), "flag");
        assert_eq!(keys.extract_key("nodots").unwrap(), "nodots");
    }

    #[test]
    fn test_extract_key_invalid() {
        let keys = KeyBuilder::default();
        assert!(matches!(
            keys.extract_key("SPLITIO.split."),
            Err(KeyError::InvalidKey(_))
        ));
        assert!(keys.extract_key("").is_err());
    }

    #[test]
    fn test_validate_prefix() {
        assert_eq!(validate_prefix(None), DEFAULT_PREFIX);
        assert_eq!(validate_prefix(Some("")), DEFAULT_PREFIX);
        assert_eq!(validate_prefix(Some("app")), "app");
    }
}
