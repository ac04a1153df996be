//! Open per-file metadata
//!
//! Keys are namespaced (`exif.camera`, `ai.caption`) so that independent
//! producers never step on each other. Values are arbitrary JSON.
//!
//! Merging is additive: a key that already exists keeps its value.

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Namespaced metadata key, `<namespace>.<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetadataKey(String);

impl MetadataKey {
    pub fn new(namespace: &str, name: &str) -> Result<Self> {
        format!("{}.{}", namespace, name).parse()
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once('.').map(|(ns, _)| ns).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.0.split_once('.').map(|(_, name)| name).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MetadataKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let (namespace, name) = s.split_once('.').ok_or_else(|| {
            AppError::validation_error(format!("metadata key '{}' has no namespace", s))
        })?;

        let namespace_ok = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !namespace_ok {
            return Err(AppError::validation_error(format!(
                "metadata namespace '{}' must be lowercase alphanumeric",
                namespace
            )));
        }
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(AppError::validation_error(format!(
                "metadata key '{}' has an empty or blank name",
                s
            )));
        }

        Ok(MetadataKey(s.to_string()))
    }
}

impl TryFrom<String> for MetadataKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MetadataKey> for String {
    fn from(key: MetadataKey) -> Self {
        key.0
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed open map with union-only merge semantics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataBag(BTreeMap<MetadataKey, serde_json::Value>);

impl MetadataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the key is already present; returns whether it was added
    pub fn insert_if_absent(&mut self, key: MetadataKey, value: serde_json::Value) -> bool {
        match self.0.entry(key) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Builder-style insert for literals
    pub fn with(mut self, key: &str, value: serde_json::Value) -> Result<Self> {
        self.insert_if_absent(key.parse()?, value);
        Ok(self)
    }

    /// Merge `other` into `self`
    ///
    /// Returns the keys that were kept at their existing value because
    /// `other` carried a different one.
    pub fn merge(&mut self, other: MetadataBag) -> Vec<MetadataKey> {
        let mut conflicts = Vec::new();
        for (key, value) in other.0 {
            match self.0.get(&key) {
                None => {
                    self.0.insert(key, value);
                }
                Some(existing) if *existing == value => {}
                Some(_) => conflicts.push(key),
            }
        }
        conflicts
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        let key: MetadataKey = key.parse().ok()?;
        self.0.get(&key)
    }

    /// Entries of one namespace
    pub fn namespace<'a>(
        &'a self,
        namespace: &'a str,
    ) -> impl Iterator<Item = (&'a MetadataKey, &'a serde_json::Value)> + 'a {
        self.0.iter().filter(move |(k, _)| k.namespace() == namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &serde_json::Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
