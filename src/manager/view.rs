//! Read-only manager views
//!
//! A view lazily snapshots the index list (reference-counted) and a deep
//! copy of all tag details, so queries observe one consistent state while
//! the manager keeps mutating. Prefetch evaluates the uncertain portion
//! of requested tags against the snapshot only; the manager's own state
//! is never touched. A view must be released explicitly, which is when
//! superseded index files become deletable.

use crate::bitmask::LongBitmask;
use crate::index::{ConverterHandle, ConverterSearchData, IndexReader, StreamRecord};
use crate::manager::error::{ManagerError, ManagerResult};
use crate::manager::{IndexReleaser, Job, ManagerState};
use crate::query::{Query, Sorting, TagDetails};
use crate::search::{search_streams, SearchError, StreamMatch};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Options for stream enumeration and search.
#[derive(Debug, Clone, Default)]
pub struct StreamsOptions {
    /// Tags whose uncertain portion should be resolved for the result set
    pub prefetch_tags: Vec<String>,
    /// Prefetch every known tag instead
    pub prefetch_all_tags: bool,
    /// Result page size when the query has no explicit limit
    pub default_limit: usize,
    /// Zero-based result page
    pub page: usize,
}

pub(crate) struct ViewState {
    pub(crate) indexes: Vec<Arc<IndexReader>>,
    pub(crate) tag_details: HashMap<String, TagDetails>,
    pub(crate) tag_converters: HashMap<String, Vec<ConverterHandle>>,
    pub(crate) converters: HashMap<String, ConverterHandle>,
}

impl ManagerState {
    pub(crate) fn view_snapshot(&mut self) -> ViewState {
        let (indexes, _releaser) = self.indexes_copy(0);
        ViewState {
            indexes,
            tag_details: self
                .tags
                .iter()
                .map(|(name, tag)| (name.clone(), tag.details.clone()))
                .collect(),
            tag_converters: self
                .tags
                .iter()
                .map(|(name, tag)| (name.clone(), tag.converters.clone()))
                .collect(),
            converters: self.converters.clone(),
        }
    }
}

/// A stable snapshot of indexes and tag details.
pub struct View {
    jobs: mpsc::UnboundedSender<Job>,
    state: Option<ViewState>,
}

impl View {
    pub(crate) fn new(jobs: mpsc::UnboundedSender<Job>) -> Self {
        Self { jobs, state: None }
    }

    /// Take the snapshot; a no-op after the first call.
    async fn fetch(&mut self) -> ManagerResult<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |state| {
                let _ = tx.send(state.view_snapshot());
            }))
            .map_err(|_| ManagerError::ChannelClosed)?;
        self.state = Some(rx.await.map_err(|_| ManagerError::ChannelClosed)?);
        Ok(())
    }

    /// Give the snapshot back; superseded index files become deletable.
    pub fn release(mut self) {
        if let Some(state) = self.state.take() {
            let _ = self.jobs.send(Box::new(move |manager| {
                IndexReleaser::new(state.indexes).release(manager);
            }));
        }
    }

    /// Earliest packet time over all snapshot indexes.
    pub async fn reference_time(&mut self) -> ManagerResult<Option<DateTime<Utc>>> {
        self.fetch().await?;
        let Some(state) = &self.state else {
            return Ok(None);
        };
        Ok(state
            .indexes
            .iter()
            .filter(|index| index.stream_count() > 0)
            .map(|index| index.reference_time())
            .min())
    }

    /// Look up one stream, newest index first.
    pub async fn stream(&mut self, stream_id: u64) -> ManagerResult<Option<StreamContext<'_>>> {
        self.fetch().await?;
        let Some(state) = self.state.as_ref() else {
            return Ok(None);
        };
        let record = state
            .indexes
            .iter()
            .rev()
            .find_map(|index| index.stream_by_id(stream_id))
            .cloned();
        Ok(record.map(|record| StreamContext {
            record,
            view: Some(state),
        }))
    }

    /// Run a query against the snapshot, prefetching requested tags for
    /// the result set.
    pub async fn search(
        &mut self,
        query: &Query,
        options: StreamsOptions,
    ) -> ManagerResult<(Vec<StreamMatch>, bool, usize)> {
        self.fetch().await?;
        let prefetch = self.prefetch_names(&options);
        let limit = query.limit.unwrap_or(options.default_limit);
        let offset = options.page * limit;
        let Some(state) = &self.state else {
            return Err(ManagerError::ChannelClosed);
        };
        let (matches, has_more) = search_streams(
            &state.indexes,
            &state.converters,
            None,
            query.reference_time,
            &query.conditions,
            query.grouping.as_ref(),
            &query.sorting,
            limit,
            offset,
            &state.tag_details,
        )?;
        if !prefetch.is_empty() && !matches.is_empty() {
            let searched: LongBitmask = matches.iter().map(|m| m.stream_id).collect();
            self.prefetch_tags(&prefetch, &searched)?;
        }
        Ok((matches, has_more, offset))
    }

    /// Every stream of the snapshot, newest index winning re-indexed IDs.
    pub async fn all_streams(
        &mut self,
        options: StreamsOptions,
    ) -> ManagerResult<Vec<StreamContext<'_>>> {
        if options.default_limit != 0 || options.page != 0 {
            return Err(ManagerError::Search(SearchError::Unsupported(
                "limit for all_streams".to_string(),
            )));
        }
        self.fetch().await?;
        let prefetch = self.prefetch_names(&options);
        self.prefetch_tags(&prefetch, &LongBitmask::new())?;
        let Some(state) = &self.state else {
            return Ok(Vec::new());
        };
        let mut records: BTreeMap<u64, StreamRecord> = BTreeMap::new();
        for index in &state.indexes {
            for record in index.all_streams() {
                records.insert(record.stream_id, record.clone());
            }
        }
        let view = self.state.as_ref();
        Ok(records
            .into_values()
            .map(|record| StreamContext { record, view })
            .collect())
    }

    fn prefetch_names(&self, options: &StreamsOptions) -> Vec<String> {
        let mut names = options.prefetch_tags.clone();
        if options.prefetch_all_tags {
            if let Some(state) = &self.state {
                names.extend(state.tag_details.keys().cloned());
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// Resolve the uncertain portion of the given tags within the
    /// snapshot's local tag details.
    fn prefetch_tags(&mut self, tags: &[String], restrict: &LongBitmask) -> ManagerResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        let mut uncertain_tags: HashMap<String, LongBitmask> = HashMap::new();
        for name in tags {
            if !state.tag_details.contains_key(name) {
                return Err(ManagerError::UnknownTag(name.clone()));
            }
            collect_uncertain(&state.tag_details, &mut uncertain_tags, name, restrict);
        }
        while !uncertain_tags.is_empty() {
            // pick a tag whose referenced tags are already settled
            let ready = uncertain_tags
                .keys()
                .find(|name| {
                    let features = state.tag_details[*name].conditions.features();
                    features
                        .main_tags
                        .iter()
                        .chain(features.sub_query_tags.iter())
                        .all(|r| !uncertain_tags.contains_key(r))
                })
                .cloned();
            let Some(name) = ready else {
                break;
            };
            let Some(uncertain) = uncertain_tags.remove(&name) else {
                break;
            };
            let conditions = state.tag_details[&name].conditions.clone();
            let (matches, _) = search_streams(
                &state.indexes,
                &state.converters,
                Some(&uncertain),
                DateTime::<Utc>::MIN_UTC,
                &conditions,
                None,
                &Sorting::id_ascending(),
                0,
                0,
                &state.tag_details,
            )?;
            if let Some(details) = state.tag_details.get_mut(&name) {
                details.uncertain.sub(&uncertain);
                details.matches.sub(&uncertain);
                for m in &matches {
                    details.matches.set(m.stream_id);
                }
            }
        }
        Ok(())
    }
}

/// Accumulate the transitive uncertain sets to resolve.
fn collect_uncertain(
    tag_details: &HashMap<String, TagDetails>,
    uncertain_tags: &mut HashMap<String, LongBitmask>,
    name: &str,
    restrict: &LongBitmask,
) {
    let Some(details) = tag_details.get(name) else {
        return;
    };
    if details.uncertain.is_zero() {
        return;
    }
    let mut uncertain = details.uncertain.clone();
    if !restrict.is_zero() {
        uncertain.and(restrict);
        if uncertain.is_zero() {
            return;
        }
    }
    if let Some(existing) = uncertain_tags.get(name) {
        let mut fresh = uncertain.clone();
        fresh.sub(existing);
        if fresh.is_zero() {
            return;
        }
        uncertain.or(existing);
    }
    uncertain_tags.insert(name.to_string(), uncertain.clone());
    let features = details.conditions.features();
    let unrestricted = LongBitmask::new();
    for referenced in &features.sub_query_tags {
        collect_uncertain(tag_details, uncertain_tags, referenced, &unrestricted);
    }
    for referenced in &features.main_tags {
        collect_uncertain(tag_details, uncertain_tags, referenced, &uncertain);
    }
}

/// One stream within a view.
pub struct StreamContext<'a> {
    record: StreamRecord,
    view: Option<&'a ViewState>,
}

impl StreamContext<'_> {
    pub fn record(&self) -> &StreamRecord {
        &self.record
    }

    pub fn stream_id(&self) -> u64 {
        self.record.stream_id
    }

    /// Whether the stream carries the tag. Uncertain membership reads as
    /// false; it is never guessed.
    pub fn has_tag(&self, name: &str) -> ManagerResult<bool> {
        let Some(view) = self.view else {
            return Ok(false);
        };
        let details = view
            .tag_details
            .get(name)
            .ok_or_else(|| ManagerError::UnknownTag(name.to_string()))?;
        if details.uncertain.is_set(self.record.stream_id) {
            return Ok(false);
        }
        Ok(details.matches.is_set(self.record.stream_id))
    }

    /// All tags certainly matching this stream, sorted.
    pub fn all_tags(&self) -> ManagerResult<Vec<String>> {
        let Some(view) = self.view else {
            return Ok(Vec::new());
        };
        let mut tags = Vec::new();
        for name in view.tag_details.keys() {
            if self.has_tag(name)? {
                tags.push(name.clone());
            }
        }
        tags.sort();
        Ok(tags)
    }

    /// Converters reachable through this stream's tags, sorted.
    pub fn all_converters(&self) -> ManagerResult<Vec<String>> {
        let Some(view) = self.view else {
            return Ok(Vec::new());
        };
        let mut names = Vec::new();
        for (tag_name, converters) in &view.tag_converters {
            if !self.has_tag(tag_name)? {
                continue;
            }
            for converter in converters {
                names.push(converter.name().to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// The stream's bytes: raw when `converter_name` is empty, otherwise
    /// through a converter attached to one of the stream's tags.
    pub fn data(&self, converter_name: &str) -> ManagerResult<ConverterSearchData> {
        let Some(view) = self.view else {
            return Err(ManagerError::UnknownStreamId(self.record.stream_id));
        };
        if converter_name.is_empty() {
            for index in view.indexes.iter().rev() {
                if let Some(record) = index.stream_by_id(self.record.stream_id) {
                    let mut reader = index.data_section_reader()?;
                    let payload = reader.stream_payload(record)?;
                    return Ok(ConverterSearchData {
                        buffers: payload.buffers,
                        buffer_lengths: payload.buffer_lengths,
                        client_bytes: record.client_bytes,
                        server_bytes: record.server_bytes,
                        was_cached: true,
                    });
                }
            }
            return Err(ManagerError::UnknownStreamId(self.record.stream_id));
        }
        for (tag_name, converters) in &view.tag_converters {
            if !self.has_tag(tag_name)? {
                continue;
            }
            for converter in converters {
                if converter.name() == converter_name {
                    return Ok(converter.data_for_search(self.record.stream_id)?);
                }
            }
        }
        Err(ManagerError::ConverterNotAttached(converter_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::{Protocol, StreamChunk, StreamEntry};
    use crate::index::write_index_file;
    use crate::query::{parse_query, Direction};

    fn entry(stream_id: u64, data: &[u8]) -> StreamEntry {
        StreamEntry {
            stream_id,
            client_host: "10.0.0.1".to_string(),
            server_host: "10.0.0.2".to_string(),
            client_port: 40000,
            server_port: 80,
            protocol: Protocol::Tcp,
            first_packet_time: Utc::now(),
            last_packet_time: Utc::now(),
            packet_count: 1,
            chunks: vec![StreamChunk {
                direction: Direction::ClientToServer,
                data: data.to_vec(),
            }],
        }
    }

    fn details(definition: &str, uncertain: &[u64]) -> TagDetails {
        TagDetails {
            matches: LongBitmask::new(),
            uncertain: uncertain.iter().copied().collect(),
            conditions: parse_query(definition).unwrap().conditions,
        }
    }

    fn test_view(dir: &std::path::Path) -> View {
        let path = dir.join("v.fdx");
        write_index_file(&path, &[entry(0, b"nothing"), entry(1, b"foo bar")]).unwrap();
        let index = Arc::new(crate::index::IndexReader::open(&path).unwrap());
        let mut tag_details = HashMap::new();
        tag_details.insert("tag/a".to_string(), details(r#"cdata:"foo""#, &[0, 1]));
        tag_details.insert("tag/b".to_string(), details("tag:a", &[0, 1]));
        let (jobs, _queue) = mpsc::unbounded_channel();
        View {
            jobs,
            state: Some(ViewState {
                indexes: vec![index],
                tag_details,
                tag_converters: HashMap::new(),
                converters: HashMap::new(),
            }),
        }
    }

    #[test]
    fn test_prefetch_resolves_dependencies_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = test_view(dir.path());
        view.prefetch_tags(&["tag/b".to_string()], &LongBitmask::new())
            .unwrap();

        let state = view.state.as_ref().unwrap();
        let a = &state.tag_details["tag/a"];
        assert!(a.uncertain.is_zero());
        assert_eq!(a.matches.iter_ones().collect::<Vec<_>>(), vec![1]);
        let b = &state.tag_details["tag/b"];
        assert!(b.uncertain.is_zero());
        assert_eq!(b.matches.iter_ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_prefetch_unknown_tag_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut view = test_view(dir.path());
        let err = view
            .prefetch_tags(&["tag/missing".to_string()], &LongBitmask::new())
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownTag(_)));
    }

    #[test]
    fn test_stream_context_never_guesses_uncertain_tags() {
        let dir = tempfile::tempdir().unwrap();
        let view = test_view(dir.path());
        let state = view.state.as_ref().unwrap();
        let context = StreamContext {
            record: state.indexes[0].stream_by_id(1).unwrap().clone(),
            view: Some(state),
        };
        // tag/a is uncertain for stream 1, so membership reads as false
        assert!(!context.has_tag("tag/a").unwrap());
        assert!(context.all_tags().unwrap().is_empty());
        assert!(context.has_tag("tag/missing").is_err());
    }
}
