//! Quarantine registry: the static map of SAE feature index → descriptor.
//!
//! The on-disk form is a JSON object keyed by decimal feature index. Values
//! are either a bare description string or an object carrying a description
//! and an optional severity:
//!
//! ```json
//! { "884": "deceptive compliance", "16274": { "description": "...", "severity": "high" } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ModxError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuarantineEntry {
    pub feature_index: usize,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Description(String),
    Detailed {
        description: String,
        #[serde(default)]
        severity: Option<Severity>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct QuarantineRegistry {
    entries: BTreeMap<usize, QuarantineEntry>,
}

impl QuarantineRegistry {
    pub fn new(entries: impl IntoIterator<Item = QuarantineEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.feature_index, e))
                .collect(),
        }
    }

    /// Parse the registry JSON. Any key that is not a non-negative integer,
    /// or any value that is neither a string nor a description object,
    /// rejects the whole file.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawEntry> = serde_json::from_str(json)
            .map_err(|e| ModxError::FeatureRegistry(format!("invalid registry JSON: {e}")))?;

        let mut entries = BTreeMap::new();
        for (key, value) in raw {
            let feature_index: usize = key.trim().parse().map_err(|_| {
                ModxError::FeatureRegistry(format!("invalid feature index '{key}'"))
            })?;
            let (description, severity) = match value {
                RawEntry::Description(d) => (d, None),
                RawEntry::Detailed {
                    description,
                    severity,
                } => (description, severity),
            };
            let entry = QuarantineEntry {
                feature_index,
                description,
                severity,
            };
            // "16274" and "016274" parse to the same index
            if entries.insert(feature_index, entry).is_some() {
                return Err(ModxError::FeatureRegistry(format!(
                    "duplicate feature index {feature_index}"
                )));
            }
        }

        Ok(Self { entries })
    }

    pub fn get(&self, feature_index: usize) -> Option<&QuarantineEntry> {
        self.entries.get(&feature_index)
    }

    pub fn contains(&self, feature_index: usize) -> bool {
        self.entries.contains_key(&feature_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending feature-index order.
    pub fn iter(&self) -> impl Iterator<Item = &QuarantineEntry> {
        self.entries.values()
    }
}
