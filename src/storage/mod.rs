//! Hierarchical job record storage
//!
//! Every job owns one record: a tree of groups and leaf values addressed by
//! slash-separated paths (`generic/status`, `output/energy/total`). Records are
//! stored in sled, one database directory per job, and support partial reads of
//! single leaves or subtrees.

pub mod sled_store;

pub use sled_store::{GroupMeta, RecordGroup, RecordHandle, RecordNode, RecordStore, ScopedWrite};

use serde_json::{Map, Value};

use crate::core::errors::{JobError, Result};

/// Major.minor format of the record layout. Readers accept any record with the
/// same major version.
pub const FORMAT_VERSION: &str = "1.0";

/// Tree-like entity whose children are partitioned into leaf values ("nodes")
/// and sub-trees ("groups").
///
/// Implementations must keep the two lists disjoint and exhaustive: every child
/// name appears in exactly one of them and resolves through [`HasGroups::child`].
pub trait HasGroups {
    type Child;

    fn list_nodes(&self) -> Result<Vec<String>>;

    fn list_groups(&self) -> Result<Vec<String>>;

    fn child(&self, name: &str) -> Result<Self::Child>;

    fn list_all(&self) -> Result<(Vec<String>, Vec<String>)> {
        Ok((self.list_nodes()?, self.list_groups()?))
    }

    fn contains(&self, name: &str) -> Result<bool> {
        let (nodes, groups) = self.list_all()?;
        Ok(nodes.iter().chain(groups.iter()).any(|n| n == name))
    }
}

/// A JSON object seen as a tree: nested objects are groups, everything else is a node.
impl HasGroups for Map<String, Value> {
    type Child = Value;

    fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(self
            .iter()
            .filter(|(_, v)| !v.is_object())
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn list_groups(&self) -> Result<Vec<String>> {
        Ok(self
            .iter()
            .filter(|(_, v)| v.is_object())
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn child(&self, name: &str) -> Result<Value> {
        self.get(name)
            .cloned()
            .ok_or_else(|| JobError::not_found(format!("no entry '{}'", name)))
    }
}

/// Normalize a slash-separated record path. The root is the empty string.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        validate_segment(segment)?;
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(JobError::configuration(format!(
            "invalid record path segment '{}'",
            segment
        )));
    }
    Ok(())
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent path and last segment; `None` for the root
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(idx) => Some((&path[..idx], &path[idx + 1..])),
        None => Some(("", path)),
    }
}

/// `true` when `version` shares the major version of [`FORMAT_VERSION`]
pub fn is_compatible_format(version: &str) -> bool {
    fn major(v: &str) -> &str {
        v.split('.').next().unwrap_or(v)
    }
    major(version) == major(FORMAT_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/output//energy/").unwrap(), "output/energy");
        assert_eq!(normalize_path("").unwrap(), "");
        assert!(normalize_path("input/../generic").is_err());
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("a/b/c"), Some(("a/b", "c")));
        assert_eq!(split_path("a"), Some(("", "a")));
        assert_eq!(split_path(""), None);
    }

    #[test]
    fn test_format_compatibility_uses_major_version() {
        assert!(is_compatible_format("1.0"));
        assert!(is_compatible_format("1.7"));
        assert!(!is_compatible_format("2.0"));
    }

    #[test]
    fn test_json_map_partition() {
        let value = json!({"a": 1, "b": {"c": 2}, "d": [1, 2], "e": {}});
        let map = value.as_object().unwrap();
        let (nodes, groups) = map.list_all().unwrap();
        assert_eq!(nodes, vec!["a".to_string(), "d".to_string()]);
        assert_eq!(groups, vec!["b".to_string(), "e".to_string()]);
        assert_eq!(map.child("a").unwrap(), json!(1));
        assert!(map.child("zz").is_err());
        assert!(map.contains("e").unwrap());
    }
}
