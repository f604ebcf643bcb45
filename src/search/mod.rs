//! Stream search
//!
//! Evaluates a query's parts against a snapshot of indexes: sub-query
//! parts first (their captures feed later parts), then the main part.
//! Every candidate stream passes the cheap filters (ID, tag references,
//! time windows) before the data-condition matcher runs.

pub mod data;
pub mod regex_analysis;

use crate::bitmask::LongBitmask;
use crate::index::{ConverterHandle, DataSectionReader, IndexError, IndexReader};
use crate::query::{
    Conditions, Filter, Grouping, QueryPart, Sorting, SortingDir, SortingKey, TagDetails,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

pub use data::{
    CompiledConditions, DataConditionsContainer, ResultData, SearchContext, StreamSource,
    SubQueryRestrictions, VariableDataEntry,
};

/// Errors produced while compiling or running a search
#[derive(Error, Debug)]
pub enum SearchError {
    /// A named capture appeared twice while matching one stream
    #[error("variable {0:?} already seen")]
    VariableAlreadySeen(String),

    /// A variable was referenced before being captured
    #[error("variable {0:?} not defined")]
    VariableNotDefined(String),

    /// A variable referenced a sub-query that was not evaluated
    #[error("unknown sub-query {0:?}")]
    UnknownSubQuery(String),

    /// Data conditions of one part named different converters
    #[error("all data conditions must use the same converter")]
    MixedConverters,

    /// A data condition named a converter that does not exist
    #[error("converter {0:?} not found")]
    ConverterNotFound(String),

    /// A tag reference names an unknown tag
    #[error("tag {0:?} not defined")]
    UnknownTag(String),

    /// A regex failed to parse or compile
    #[error("regex error: {0}")]
    Regex(String),

    /// The query uses a feature this backend does not evaluate
    #[error("unsupported query feature: {0}")]
    Unsupported(String),

    /// Index access failed
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Result type alias for search operations
pub type SearchResult<T> = Result<T, SearchError>;

/// One matched stream with the variables it captured.
#[derive(Debug, Clone, Default)]
pub struct StreamMatch {
    pub stream_id: u64,
    pub variables: HashMap<String, Vec<Vec<u8>>>,
}

/// Evaluate a query against an index snapshot.
///
/// `restrict` narrows the main part to the given stream set; `limit` of 0
/// means unlimited. Returns the matches plus whether more results exist
/// past `offset + limit`.
#[allow(clippy::too_many_arguments)]
pub fn search_streams(
    indexes: &[Arc<IndexReader>],
    converters: &HashMap<String, ConverterHandle>,
    restrict: Option<&LongBitmask>,
    reference_time: DateTime<Utc>,
    conditions: &Conditions,
    grouping: Option<&Grouping>,
    sorting: &[Sorting],
    limit: usize,
    offset: usize,
    tag_details: &HashMap<String, TagDetails>,
) -> SearchResult<(Vec<StreamMatch>, bool)> {
    if grouping.is_some() {
        return Err(SearchError::Unsupported("grouping".to_string()));
    }

    let mut previous_results: HashMap<String, ResultData> = HashMap::new();
    for (name, part) in conditions.sub_queries() {
        let matches = evaluate_part(
            indexes,
            converters,
            part,
            None,
            reference_time,
            &previous_results,
            tag_details,
        )?;
        if matches.is_empty() {
            // a part with no matching streams empties the whole query
            return Ok((Vec::new(), false));
        }
        previous_results.insert(name.to_string(), result_data(matches));
    }

    let main = conditions
        .main()
        .ok_or_else(|| SearchError::Unsupported("query without a main part".to_string()))?;
    let mut matches = evaluate_part(
        indexes,
        converters,
        main,
        restrict,
        reference_time,
        &previous_results,
        tag_details,
    )?;

    for sort in sorting.iter().rev() {
        match (sort.key, sort.dir) {
            (SortingKey::Id, SortingDir::Ascending) => {
                matches.sort_by_key(|m| m.stream_id);
            }
            (SortingKey::Id, SortingDir::Descending) => {
                matches.sort_by_key(|m| std::cmp::Reverse(m.stream_id));
            }
        }
    }

    if offset >= matches.len() {
        return Ok((Vec::new(), false));
    }
    let mut matches = matches.split_off(offset);
    let has_more = limit != 0 && matches.len() > limit;
    if has_more {
        matches.truncate(limit);
    }
    Ok((matches, has_more))
}

/// Evaluate one query part over all candidate streams.
fn evaluate_part(
    indexes: &[Arc<IndexReader>],
    converters: &HashMap<String, ConverterHandle>,
    part: &QueryPart,
    restrict: Option<&LongBitmask>,
    reference_time: DateTime<Utc>,
    previous_results: &HashMap<String, ResultData>,
    tag_details: &HashMap<String, TagDetails>,
) -> SearchResult<Vec<StreamMatch>> {
    let mut container = DataConditionsContainer::new();
    for condition in &part.data_conditions {
        container.add(condition, previous_results)?;
    }
    let compiled = container.finalize(converters, previous_results)?;
    if matches!(compiled, CompiledConditions::AlwaysFail) {
        return Ok(Vec::new());
    }

    // candidate streams in ID order; the newest index wins a re-indexed ID
    let mut candidates: BTreeMap<u64, usize> = BTreeMap::new();
    for (pos, index) in indexes.iter().enumerate() {
        for stream_id in index.stream_ids() {
            candidates.insert(stream_id, pos);
        }
    }

    let mut readers: HashMap<usize, DataSectionReader> = HashMap::new();
    let mut matches = Vec::new();
    for (stream_id, pos) in candidates {
        if let Some(restrict) = restrict {
            if !restrict.is_set(stream_id) {
                continue;
            }
        }
        let Some(record) = indexes[pos].stream_by_id(stream_id) else {
            continue;
        };
        if !passes_filters(record, &part.filters, reference_time, tag_details)? {
            continue;
        }
        match &compiled {
            CompiledConditions::AlwaysSuccess => {
                matches.push(StreamMatch {
                    stream_id,
                    variables: HashMap::new(),
                });
            }
            CompiledConditions::AlwaysFail => return Ok(Vec::new()),
            CompiledConditions::Filter(filter) => {
                let reader = match readers.entry(pos) {
                    std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
                    std::collections::hash_map::Entry::Vacant(vacant) => {
                        vacant.insert(indexes[pos].data_section_reader()?)
                    }
                };
                let mut context = SearchContext::new(previous_results);
                let mut source = StreamSource {
                    raw: reader,
                    converters,
                };
                if filter.matches_stream(&mut context, record, &mut source)? {
                    matches.push(StreamMatch {
                        stream_id,
                        variables: context.output_variables,
                    });
                }
            }
        }
    }
    Ok(matches)
}

fn passes_filters(
    record: &crate::index::StreamRecord,
    filters: &[Filter],
    reference_time: DateTime<Utc>,
    tag_details: &HashMap<String, TagDetails>,
) -> SearchResult<bool> {
    for filter in filters {
        let ok = match filter {
            Filter::Id(ids) => ids.binary_search(&record.stream_id).is_ok(),
            Filter::Tag(name) => {
                let details = tag_details
                    .get(name)
                    .ok_or_else(|| SearchError::UnknownTag(name.clone()))?;
                // uncertain membership is never guessed
                !details.uncertain.is_set(record.stream_id)
                    && details.matches.is_set(record.stream_id)
            }
            Filter::TimeAbsolute { from, to } => {
                from.map_or(true, |t| record.first_packet_time >= t)
                    && to.map_or(true, |t| record.first_packet_time <= t)
            }
            Filter::TimeRelative { from, to } => {
                let from = from.map(|secs| reference_time + Duration::seconds(secs));
                let to = to.map(|secs| reference_time + Duration::seconds(secs));
                from.map_or(true, |t| record.first_packet_time >= t)
                    && to.map_or(true, |t| record.first_packet_time <= t)
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Fold part matches into the result shape later parts consume.
fn result_data(matches: Vec<StreamMatch>) -> ResultData {
    let mut rd = ResultData::default();
    for m in &matches {
        rd.stream_ids.push(m.stream_id);
        if m.variables.is_empty() {
            continue;
        }
        let mut data: Vec<(String, Vec<u8>)> = m
            .variables
            .iter()
            .flat_map(|(name, values)| {
                values
                    .iter()
                    .map(move |value| (name.clone(), value.clone()))
            })
            .collect();
        data.sort();
        let entry_idx = if let Some(pos) = rd.variable_data.iter().position(|e| e.data == data) {
            rd.variable_data[pos].uses += 1;
            pos
        } else {
            rd.variable_data.push(VariableDataEntry { uses: 1, data });
            rd.variable_data.len() - 1
        };
        rd.variable_association.insert(m.stream_id, entry_idx);
    }
    rd
}
