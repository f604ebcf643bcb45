//! Query Abstract Syntax Tree
//!
//! A query is a conjunction of filter terms split into *parts*: the main
//! part plus zero or more named sub-query parts. Data terms carry regexes
//! over directional stream bytes and may reference variables captured
//! earlier in the same stream (`${name}`) or captured by a sub-query part
//! (`${sub.name}`).

use crate::bitmask::LongBitmask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

/// Name of the main query part.
pub const MAIN_PART: &str = "";

/// Bit-flag set of filter kinds used by a query part.
///
/// Tag references are tracked separately in [`FeatureSet`]; they influence
/// uncertainty through inheritance, not through a feature flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags(u8);

impl FeatureFlags {
    pub const NONE: FeatureFlags = FeatureFlags(0);
    pub const FILTER_ID: FeatureFlags = FeatureFlags(1);
    pub const FILTER_DATA: FeatureFlags = FeatureFlags(2);
    pub const FILTER_TIME_ABSOLUTE: FeatureFlags = FeatureFlags(4);
    pub const FILTER_TIME_RELATIVE: FeatureFlags = FeatureFlags(8);

    /// True if no flag is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if any flag of `other` is set in `self`.
    pub fn intersects(&self, other: FeatureFlags) -> bool {
        self.0 & other.0 != 0
    }

    /// `self` with the flags of `other` removed.
    pub fn without(&self, other: FeatureFlags) -> FeatureFlags {
        FeatureFlags(self.0 & !other.0)
    }
}

impl BitOr for FeatureFlags {
    type Output = FeatureFlags;

    fn bitor(self, rhs: FeatureFlags) -> FeatureFlags {
        FeatureFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FeatureFlags {
    fn bitor_assign(&mut self, rhs: FeatureFlags) {
        self.0 |= rhs.0;
    }
}

/// Derived summary of what a query touches, used for invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    /// Filter kinds used by the main part
    pub main_features: FeatureFlags,
    /// Filter kinds used by any sub-query part
    pub sub_query_features: FeatureFlags,
    /// Tags referenced by the main part
    pub main_tags: Vec<String>,
    /// Tags referenced by sub-query parts
    pub sub_query_tags: Vec<String>,
}

/// Direction of one half of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer = 0,
    ServerToClient = 1,
}

impl Direction {
    /// Index into two-element per-direction arrays.
    pub fn idx(self) -> usize {
        self as usize
    }

    /// The opposite direction.
    pub fn flip(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// A variable reference inside a data regex.
///
/// The reference itself is stripped from the stored regex; `position` is
/// the byte offset in the stripped regex where the substituted content is
/// inserted. An empty `sub_query` means the value is captured earlier in
/// the same stream's matching run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub sub_query: String,
    pub position: usize,
}

/// One regex of a data condition sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataElement {
    /// Converter whose output the regex runs on; empty means raw plus
    /// every known converter.
    pub converter_name: String,
    /// Regex source with variable references stripped
    pub regex: String,
    /// Variables to substitute, ordered by position
    pub variables: Vec<Variable>,
    /// Which half of the stream the regex applies to
    pub direction: Direction,
}

/// An ordered sequence of data elements that must match in turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataCondition {
    pub elements: Vec<DataElement>,
    /// An inverted condition fails the stream when fully matched
    pub inverted: bool,
}

/// A non-data filter term.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Explicit stream ID list; empty list means "no stream" (`id:-1`)
    Id(Vec<u64>),
    /// Reference to another tag by full name (`tag/x`, `service/x`, ...)
    Tag(String),
    /// Absolute time window on the first packet
    TimeAbsolute {
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    },
    /// Time window in seconds relative to the query reference time
    TimeRelative { from: Option<i64>, to: Option<i64> },
}

/// The filters and data conditions of one query part.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPart {
    pub filters: Vec<Filter>,
    pub data_conditions: Vec<DataCondition>,
}

impl QueryPart {
    fn features(&self) -> (FeatureFlags, Vec<String>) {
        let mut flags = FeatureFlags::NONE;
        let mut tags = Vec::new();
        for filter in &self.filters {
            match filter {
                Filter::Id(_) => flags |= FeatureFlags::FILTER_ID,
                Filter::Tag(name) => {
                    if !tags.contains(name) {
                        tags.push(name.clone());
                    }
                }
                Filter::TimeAbsolute { .. } => flags |= FeatureFlags::FILTER_TIME_ABSOLUTE,
                Filter::TimeRelative { .. } => flags |= FeatureFlags::FILTER_TIME_RELATIVE,
            }
        }
        if !self.data_conditions.is_empty() {
            flags |= FeatureFlags::FILTER_DATA;
        }
        (flags, tags)
    }
}

/// All parts of a query; the entry named [`MAIN_PART`] is the main part.
///
/// Sub-query parts are kept in declaration order because later parts may
/// consume variables captured by earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    pub parts: Vec<(String, QueryPart)>,
}

impl Conditions {
    /// The main query part, if present.
    pub fn main(&self) -> Option<&QueryPart> {
        self.parts.iter().find(|(n, _)| n == MAIN_PART).map(|(_, p)| p)
    }

    /// Sub-query parts in declaration order.
    pub fn sub_queries(&self) -> impl Iterator<Item = (&str, &QueryPart)> {
        self.parts
            .iter()
            .filter(|(n, _)| n != MAIN_PART)
            .map(|(n, p)| (n.as_str(), p))
    }

    /// Derive the feature summary used by tag invalidation.
    pub fn features(&self) -> FeatureSet {
        let mut set = FeatureSet::default();
        for (name, part) in &self.parts {
            let (flags, tags) = part.features();
            if name == MAIN_PART {
                set.main_features |= flags;
                for t in tags {
                    if !set.main_tags.contains(&t) {
                        set.main_tags.push(t);
                    }
                }
            } else {
                set.sub_query_features |= flags;
                for t in tags {
                    if !set.sub_query_tags.contains(&t) {
                        set.sub_query_tags.push(t);
                    }
                }
            }
        }
        set
    }

    /// Resolve the conditions to a concrete stream ID set.
    ///
    /// Succeeds only when the whole query is a single `id:` filter; IDs at
    /// or beyond `next_stream_id` are dropped.
    pub fn stream_ids(&self, next_stream_id: u64) -> Option<LongBitmask> {
        if self.parts.len() != 1 {
            return None;
        }
        let (name, part) = &self.parts[0];
        if name != MAIN_PART || !part.data_conditions.is_empty() || part.filters.len() != 1 {
            return None;
        }
        match &part.filters[0] {
            Filter::Id(ids) => Some(
                ids.iter()
                    .copied()
                    .filter(|&id| id < next_stream_id)
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Snapshot of one tag's evaluation state, as consumed by searches that
/// reference the tag.
///
/// `matches` is only meaningful for bits not set in `uncertain`; a stream
/// whose membership is uncertain is treated as not matching, never
/// guessed.
#[derive(Debug, Clone, Default)]
pub struct TagDetails {
    pub matches: LongBitmask,
    pub uncertain: LongBitmask,
    pub conditions: Conditions,
}

/// Sort key for search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortingKey {
    Id,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortingDir {
    Ascending,
    Descending,
}

/// One sorting criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sorting {
    pub key: SortingKey,
    pub dir: SortingDir,
}

impl Sorting {
    /// The default ordering used by tag evaluation.
    pub fn id_ascending() -> Vec<Sorting> {
        vec![Sorting {
            key: SortingKey::Id,
            dir: SortingDir::Ascending,
        }]
    }
}

/// Result grouping request; not allowed in tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    pub key: String,
}

/// A parsed query ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub conditions: Conditions,
    /// Anchor for relative time windows, captured at parse time
    pub reference_time: DateTime<Utc>,
    pub grouping: Option<Grouping>,
    pub sorting: Vec<Sorting>,
    pub limit: Option<usize>,
}

/// Expand a `tag:`/`service:`/`mark:`/`generated:` keyword into the full
/// tag name it references.
pub fn referenced_tag_name(keyword: &str, value: &str) -> String {
    format!("{keyword}/{value}")
}
