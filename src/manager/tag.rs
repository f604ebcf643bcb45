//! Tag store types
//!
//! A tag is a named, persisted query that is re-evaluated in the
//! background. `mark/` and `generated/` tags are authoritative ID lists
//! and never become uncertain.

use crate::index::ConverterHandle;
use crate::manager::error::ManagerError;
use crate::query::{FeatureSet, TagDetails};
use serde::Serialize;

/// Tag name prefixes that make a tag an explicit mark.
const MARK_PREFIXES: [&str; 2] = ["mark/", "generated/"];
/// All valid tag name prefixes.
const TAG_PREFIXES: [&str; 4] = ["tag/", "service/", "mark/", "generated/"];

/// Full tag state as owned by the manager.
#[derive(Clone)]
pub(crate) struct Tag {
    pub details: TagDetails,
    /// Original query string; regenerated for mark tags
    pub definition: String,
    pub features: FeatureSet,
    pub color: String,
    /// Attached converters, ordered, deduplicated by identity
    pub converters: Vec<ConverterHandle>,
}

impl Tag {
    /// Names of every tag this tag references, main part first.
    pub fn referenced_tags(&self) -> impl Iterator<Item = &str> {
        self.features
            .main_tags
            .iter()
            .chain(self.features.sub_query_tags.iter())
            .map(String::as_str)
    }

    pub fn converter_names(&self) -> Vec<String> {
        self.converters
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}

/// Summary of one tag as reported by `list_tags`.
#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub name: String,
    pub definition: String,
    pub color: String,
    /// Streams known to match (uncertain ones excluded)
    pub matching_count: usize,
    pub uncertain_count: usize,
    /// Whether any other tag references this one
    pub referenced: bool,
}

/// True for `mark/` and `generated/` names.
pub(crate) fn is_mark_name(name: &str) -> bool {
    MARK_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Check prefix and non-empty suffix of a tag name.
pub(crate) fn validate_tag_name(name: &str) -> Result<(), ManagerError> {
    for prefix in TAG_PREFIXES {
        if let Some(suffix) = name.strip_prefix(prefix) {
            if suffix.is_empty() {
                return Err(ManagerError::InvalidTagName);
            }
            return Ok(());
        }
    }
    Err(ManagerError::InvalidTagName)
}
