//! Artifacts: named, located, typed dataset references.
//!
//! An [`Artifact`] points at data living on an executor (a file or a
//! directory) and carries a format tag plus free-form attributes. Artifacts
//! are never mutated once created; stages hand them to each other by value.
//!
//! The [`ArtifactCatalog`] is the static part of the picture: the `artifacts`
//! section of the configuration, read once at startup and looked up by name.

pub mod format;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reference to a dataset at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Catalog name, when the artifact came from the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Path of the data on its executor.
    pub url: String,
    /// Format tag, see [`format`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Name of the executor owning the data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    /// Free-form attributes.
    #[serde(default)]
    pub attrs: BTreeMap<String, Value>,
}

impl Artifact {
    /// Creates an artifact produced on `executor`.
    pub fn of(url: impl Into<String>, format: &str, executor: &str) -> Self {
        Self {
            key: None,
            url: url.into(),
            format: Some(format.to_string()),
            executor: Some(executor.to_string()),
            attrs: BTreeMap::new(),
        }
    }

    /// Sets an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Format tag, or an empty string when untagged.
    pub fn format(&self) -> &str {
        self.format.as_deref().unwrap_or("")
    }

    /// Returns the string items of a list attribute; non-strings are skipped.
    pub fn attr_strings(&self, key: &str) -> Vec<String> {
        match self.attrs.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Name to artifact mapping loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactCatalog {
    entries: HashMap<String, Artifact>,
}

impl ArtifactCatalog {
    /// Builds a catalog, stamping each artifact with its catalog name.
    pub fn new(entries: HashMap<String, Artifact>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(name, mut artifact)| {
                artifact.key = Some(name.clone());
                (name, artifact)
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Catalog names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
