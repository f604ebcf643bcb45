//! Tag/index manager
//!
//! A single-writer state machine: all mutable state lives inside one
//! [`ManagerState`] owned by a task that drains a closure queue, so every
//! mutation is serialized without locks. Long work (imports, merges, tag
//! evaluation, converter delegation) runs on blocking worker threads
//! holding reference-counted index snapshots and posts a completion
//! closure back onto the queue. Public operations enqueue a closure and
//! await the reply on a one-shot channel.

pub mod error;
pub mod state;
pub mod tag;
pub mod view;

use crate::bitmask::LongBitmask;
use crate::config::Config;
use crate::index::{
    merge, same_converter, ConverterHandle, IndexBuilder, IndexReader, PcapInfo, StreamRecord,
};
use crate::query::{parse_query, FeatureFlags, Sorting, TagDetails};
use crate::search::{search_streams, StreamMatch};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

pub use error::{ManagerError, ManagerResult};
pub use tag::TagInfo;
pub use view::{StreamContext, StreamsOptions, View};

use tag::{is_mark_name, validate_tag_name, Tag};

pub(crate) type Job = Box<dyn FnOnce(&mut ManagerState) + Send>;

/// Counters reported by [`Manager::status`].
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub import_job_count: usize,
    pub index_count: usize,
    pub index_lock_count: usize,
    pub pcap_count: usize,
    pub stream_count: usize,
    pub packet_count: u64,
    pub merge_job_running: bool,
    pub tagging_job_running: bool,
    pub converter_processes_running: HashMap<String, bool>,
}

/// One of the five tag update operations.
#[derive(Debug, Clone)]
pub enum UpdateTagOperation {
    UpdateColor(String),
    MarkAddStreams(Vec<u64>),
    MarkDelStreams(Vec<u64>),
    AddConverter(String),
    DelConverter(String),
}

/// Releases a snapshot's index locks; at zero the superseded file is
/// removed from disk.
pub(crate) struct IndexReleaser(Vec<Arc<IndexReader>>);

impl IndexReleaser {
    pub(crate) fn new(indexes: Vec<Arc<IndexReader>>) -> Self {
        Self(indexes)
    }

    pub(crate) fn release(self, state: &mut ManagerState) {
        for index in self.0 {
            let key = Arc::as_ptr(&index) as usize;
            let remaining = match state.used_indexes.get_mut(&key) {
                Some(count) => {
                    *count -= 1;
                    *count
                }
                None => continue,
            };
            if remaining == 0 {
                state.used_indexes.remove(&key);
                if let Err(e) = std::fs::remove_file(index.path()) {
                    tracing::warn!(file = %index.path().display(), error = %e, "unable to delete superseded index");
                }
            }
        }
    }
}

/// All mutable manager state; touched only from queue closures.
pub(crate) struct ManagerState {
    pub(crate) config: Config,
    pub(crate) jobs: mpsc::UnboundedSender<Job>,
    pub(crate) builder: Arc<dyn IndexBuilder>,

    pub(crate) indexes: Vec<Arc<IndexReader>>,
    pub(crate) n_streams: usize,
    pub(crate) n_packets: u64,
    pub(crate) next_stream_id: u64,
    pub(crate) n_unmergeable_indexes: usize,
    pub(crate) state_filename: Option<PathBuf>,
    pub(crate) all_streams: LongBitmask,

    pub(crate) updated_streams_during_tagging_job: LongBitmask,
    pub(crate) added_streams_during_tagging_job: LongBitmask,
    pub(crate) merge_job_running: bool,
    pub(crate) tagging_job_running: bool,
    pub(crate) import_jobs: Vec<String>,

    pub(crate) tags: HashMap<String, Tag>,
    pub(crate) converters: HashMap<String, ConverterHandle>,
    pub(crate) used_indexes: HashMap<usize, usize>,
}

/// Handle to the manager task. Cheap to clone; all operations enqueue
/// onto the same closure queue.
#[derive(Clone)]
pub struct Manager {
    jobs: mpsc::UnboundedSender<Job>,
}

impl Manager {
    /// Open the manager: load existing indexes and the latest state file,
    /// then start the scheduler task.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        config: Config,
        builder: Arc<dyn IndexBuilder>,
        converters: Vec<ConverterHandle>,
    ) -> ManagerResult<Manager> {
        for dir in [
            &config.pcap_dir,
            &config.index_dir,
            &config.state_dir,
            &config.converter_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let converters: HashMap<String, ConverterHandle> = converters
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();

        // load every readable index
        let mut index_files: Vec<PathBuf> = std::fs::read_dir(&config.index_dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "fdx"))
            .collect();
        index_files.sort();
        let mut indexes = Vec::new();
        let mut n_streams = 0;
        let mut n_packets = 0;
        let mut next_stream_id = 0;
        for path in index_files {
            let index = match IndexReader::open(&path) {
                Ok(index) => Arc::new(index),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "unable to load index");
                    continue;
                }
            };
            n_streams += index.stream_count();
            n_packets += index.packet_count();
            if index.stream_count() > 0 {
                next_stream_id = next_stream_id.max(index.max_stream_id() + 1);
            }
            indexes.push(index);
        }

        let all_streams = LongBitmask::all_below(next_stream_id);
        let loaded = state::load_state(&config.state_dir, &converters, &all_streams, next_stream_id);

        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let mut state = ManagerState {
            config,
            jobs: jobs.clone(),
            builder,
            indexes,
            n_streams,
            n_packets,
            next_stream_id,
            n_unmergeable_indexes: 0,
            state_filename: None,
            all_streams,
            updated_streams_during_tagging_job: LongBitmask::new(),
            added_streams_during_tagging_job: LongBitmask::new(),
            merge_job_running: false,
            tagging_job_running: false,
            import_jobs: Vec::new(),
            tags: HashMap::new(),
            converters,
            used_indexes: HashMap::new(),
        };
        let indexes_snapshot = state.indexes.clone();
        state.lock(&indexes_snapshot);
        match loaded {
            Some(loaded) => {
                state.tags = loaded.tags;
                state.state_filename = Some(loaded.filename);
                state.builder.set_known_pcaps(loaded.pcaps);
            }
            None => state.save_state_logged(),
        }

        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                job(&mut state);
            }
        });

        let manager = Manager { jobs };
        manager.enqueue(Box::new(|state| {
            state.start_tagging_job_if_needed();
            state.start_merge_job_if_needed();
            let names: Vec<String> = state.tags.keys().cloned().collect();
            for name in names {
                state.delegate_tag_matches(&name);
            }
        }))?;
        Ok(manager)
    }

    pub(crate) fn enqueue(&self, job: Job) -> ManagerResult<()> {
        self.jobs.send(job).map_err(|_| ManagerError::ChannelClosed)
    }

    async fn call<T, F>(&self, f: F) -> ManagerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ManagerState) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move |state| {
            let _ = tx.send(f(state));
        }))?;
        rx.await.map_err(|_| ManagerError::ChannelClosed)
    }

    /// Current counters, observed between queue closures.
    pub async fn status(&self) -> ManagerResult<Statistics> {
        self.call(|state| state.statistics()).await
    }

    /// Metadata of every capture file imported so far.
    pub async fn known_pcaps(&self) -> ManagerResult<Vec<PcapInfo>> {
        self.call(|state| state.builder.known_pcaps()).await
    }

    /// Names of all registered converters, sorted.
    pub async fn list_converters(&self) -> ManagerResult<Vec<String>> {
        self.call(|state| {
            let mut names: Vec<String> = state.converters.keys().cloned().collect();
            names.sort();
            names
        })
        .await
    }

    /// All tags with their match counts, sorted by name.
    pub async fn list_tags(&self) -> ManagerResult<Vec<TagInfo>> {
        self.call(|state| state.list_tags()).await
    }

    /// Create a tag from a query string.
    pub async fn add_tag(&self, name: &str, color: &str, query_string: &str) -> ManagerResult<()> {
        validate_tag_name(name)?;
        let is_mark = is_mark_name(name);
        let query = parse_query(query_string)?;
        let features = query.conditions.features();
        if (features.main_features | features.sub_query_features)
            .intersects(FeatureFlags::FILTER_TIME_RELATIVE)
        {
            return Err(ManagerError::UnsupportedFeature("relative times"));
        }
        if query.grouping.is_some() {
            return Err(ManagerError::UnsupportedFeature("grouping"));
        }
        let tag = Tag {
            details: TagDetails {
                matches: LongBitmask::new(),
                uncertain: LongBitmask::new(),
                conditions: query.conditions.clone(),
            },
            definition: query_string.to_string(),
            features,
            color: color.to_string(),
            converters: Vec::new(),
        };
        if tag.referenced_tags().any(|r| r == name) {
            return Err(ManagerError::SelfReference);
        }
        if is_mark && query.conditions.stream_ids(0).is_none() {
            return Err(ManagerError::MalformedMark);
        }
        let name = name.to_string();
        self.call(move |state| {
            let result = state.add_tag_locked(name, tag, is_mark);
            state.save_state_logged();
            result
        })
        .await?
    }

    /// Delete a tag; fails while other tags reference it.
    pub async fn del_tag(&self, name: &str) -> ManagerResult<()> {
        let name = name.to_string();
        self.call(move |state| {
            let result = state.del_tag_locked(&name);
            state.save_state_logged();
            result
        })
        .await?
    }

    /// Apply one update operation to a tag.
    pub async fn update_tag(&self, name: &str, operation: UpdateTagOperation) -> ManagerResult<()> {
        if let UpdateTagOperation::MarkAddStreams(_) | UpdateTagOperation::MarkDelStreams(_) =
            &operation
        {
            if !is_mark_name(name) {
                return Err(ManagerError::MalformedMark);
            }
        }
        let name = name.to_string();
        self.call(move |state| {
            let result = state.update_tag_locked(&name, operation);
            state.save_state_logged();
            result
        })
        .await?
    }

    /// Queue a capture file for import; imports run serially.
    pub fn import_pcap(&self, filename: impl Into<String>) -> ManagerResult<()> {
        let filename = filename.into();
        self.enqueue(Box::new(move |state| {
            state.import_jobs.push(filename);
            if state.import_jobs.len() == 1 {
                state.spawn_import_job();
            }
        }))
    }

    /// Register a converter discovered by the watcher.
    pub async fn add_converter(&self, converter: ConverterHandle) -> ManagerResult<()> {
        self.call(move |state| {
            state
                .converters
                .insert(converter.name().to_string(), converter);
        })
        .await
    }

    /// Remove a converter: detach it from every tag and stop its process.
    pub async fn remove_converter(&self, name: &str) -> ManagerResult<()> {
        let name = name.to_string();
        self.call(move |state| state.remove_converter_locked(&name)).await?
    }

    /// Restart a converter's process, dropping its cache.
    pub async fn restart_converter(&self, name: &str) -> ManagerResult<()> {
        let name = name.to_string();
        self.call(move |state| -> ManagerResult<()> {
            let converter = state
                .converters
                .get(&name)
                .ok_or_else(|| ManagerError::UnknownConverter(name.clone()))?;
            converter.reset()?;
            Ok(())
        })
        .await?
    }

    /// A read-only snapshot; indexes stay on disk until it is released.
    pub fn get_view(&self) -> View {
        View::new(self.jobs.clone())
    }
}

impl ManagerState {
    fn statistics(&self) -> Statistics {
        Statistics {
            import_job_count: self.import_jobs.len(),
            index_count: self.indexes.len(),
            index_lock_count: self.used_indexes.values().sum(),
            pcap_count: self.builder.known_pcaps().len(),
            stream_count: self.n_streams,
            packet_count: self.n_packets,
            merge_job_running: self.merge_job_running,
            tagging_job_running: self.tagging_job_running,
            converter_processes_running: self
                .converters
                .iter()
                .map(|(name, c)| (name.clone(), c.is_running()))
                .collect(),
        }
    }

    pub(crate) fn lock(&mut self, indexes: &[Arc<IndexReader>]) -> IndexReleaser {
        for index in indexes {
            *self
                .used_indexes
                .entry(Arc::as_ptr(index) as usize)
                .or_insert(0) += 1;
        }
        IndexReleaser(indexes.to_vec())
    }

    pub(crate) fn indexes_copy(&mut self, start: usize) -> (Vec<Arc<IndexReader>>, IndexReleaser) {
        let indexes: Vec<Arc<IndexReader>> = self.indexes[start..].to_vec();
        let releaser = self.lock(&indexes);
        (indexes, releaser)
    }

    pub(crate) fn save_state_logged(&mut self) {
        let pcaps = self.builder.known_pcaps();
        match state::save_state(
            &self.config.state_dir,
            self.state_filename.as_deref(),
            &self.tags,
            &pcaps,
        ) {
            Ok(filename) => self.state_filename = Some(filename),
            Err(e) => tracing::warn!(error = %e, "unable to save state"),
        }
    }

    fn list_tags(&self) -> Vec<TagInfo> {
        let mut referenced: Vec<&str> = Vec::new();
        for tag in self.tags.values() {
            referenced.extend(tag.referenced_tags());
        }
        let mut infos: Vec<TagInfo> = self
            .tags
            .iter()
            .map(|(name, tag)| {
                let mut matching = tag.details.matches.clone();
                matching.sub(&tag.details.uncertain);
                TagInfo {
                    name: name.clone(),
                    definition: tag.definition.clone(),
                    color: tag.color.clone(),
                    matching_count: matching.ones_count(),
                    uncertain_count: tag.details.uncertain.ones_count(),
                    referenced: referenced.contains(&name.as_str()),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    fn add_tag_locked(&mut self, name: String, mut tag: Tag, is_mark: bool) -> ManagerResult<()> {
        if self.tags.contains_key(&name) {
            return Err(ManagerError::TagAlreadyExists);
        }
        for referenced in tag.referenced_tags() {
            if !self.tags.contains_key(referenced) {
                return Err(ManagerError::UnknownTag(referenced.to_string()));
            }
        }
        if is_mark {
            tag.details.matches = tag
                .details
                .conditions
                .stream_ids(self.next_stream_id)
                .unwrap_or_default();
        } else {
            tag.details.uncertain = self.all_streams.clone();
        }
        self.tags.insert(name, tag);
        if !is_mark {
            self.start_tagging_job_if_needed();
        }
        Ok(())
    }

    fn del_tag_locked(&mut self, name: &str) -> ManagerResult<()> {
        if !self.tags.contains_key(name) {
            return Err(ManagerError::UnknownTag(name.to_string()));
        }
        for (other_name, other) in &self.tags {
            if other_name != name && other.referenced_tags().any(|r| r == name) {
                return Err(ManagerError::TagReferencedByOther(other_name.clone()));
            }
        }
        if let Some(tag) = self.tags.get(name) {
            for converter in tag.converters.clone() {
                converter.detach_tag(name)?;
            }
        }
        self.tags.remove(name);
        Ok(())
    }

    fn update_tag_locked(
        &mut self,
        name: &str,
        operation: UpdateTagOperation,
    ) -> ManagerResult<()> {
        if !self.tags.contains_key(name) {
            return Err(ManagerError::UnknownTag(name.to_string()));
        }
        match operation {
            UpdateTagOperation::UpdateColor(color) => {
                if let Some(tag) = self.tags.get_mut(name) {
                    tag.color = color;
                }
                Ok(())
            }
            UpdateTagOperation::AddConverter(converter_name) => {
                let converter = self
                    .converters
                    .get(&converter_name)
                    .ok_or_else(|| ManagerError::UnknownConverter(converter_name.clone()))?
                    .clone();
                let attached = match self.tags.get_mut(name) {
                    Some(tag) => attach_converter_to_tag(tag, name, &converter),
                    None => false,
                };
                if attached {
                    self.delegate_tag_matches(name);
                }
                Ok(())
            }
            UpdateTagOperation::DelConverter(converter_name) => {
                if !self.converters.contains_key(&converter_name) {
                    return Err(ManagerError::UnknownConverter(converter_name.clone()));
                }
                let Some(tag) = self.tags.get_mut(name) else {
                    return Err(ManagerError::UnknownTag(name.to_string()));
                };
                let position = tag
                    .converters
                    .iter()
                    .position(|c| c.name() == converter_name)
                    .ok_or(ManagerError::ConverterNotAttached(converter_name))?;
                let converter = tag.converters.remove(position);
                converter.detach_tag(name)?;
                Ok(())
            }
            UpdateTagOperation::MarkAddStreams(add) => self.update_mark(name, &add, &[]),
            UpdateTagOperation::MarkDelStreams(del) => self.update_mark(name, &[], &del),
        }
    }

    /// Apply an explicit stream-list change to a mark tag and regenerate
    /// its `id:` definition.
    fn update_mark(&mut self, name: &str, add: &[u64], del: &[u64]) -> ManagerResult<()> {
        if add.is_empty() && del.is_empty() {
            return Ok(());
        }
        for &stream_id in add.iter().chain(del) {
            if stream_id >= self.next_stream_id {
                return Err(ManagerError::UnknownStreamId(stream_id));
            }
        }
        let Some(tag) = self.tags.get(name) else {
            return Err(ManagerError::UnknownTag(name.to_string()));
        };
        let mut new_tag = tag.clone();
        for &stream_id in add {
            new_tag.details.matches.set(stream_id);
            new_tag.details.uncertain.set(stream_id);
        }
        for &stream_id in del {
            new_tag.details.matches.unset(stream_id);
            new_tag.details.uncertain.set(stream_id);
        }

        let definition = if new_tag.details.matches.is_zero() {
            "id:-1".to_string()
        } else {
            let ids: Vec<String> = new_tag
                .details
                .matches
                .iter_ones()
                .map(|id| id.to_string())
                .collect();
            format!("id:{}", ids.join(","))
        };
        new_tag.definition = definition;
        if let Ok(query) = parse_query(&new_tag.definition) {
            new_tag.details.conditions = query.conditions;
        }
        self.tags.insert(name.to_string(), new_tag);
        self.inherit_tag_uncertainty();
        if let Some(tag) = self.tags.get_mut(name) {
            // marks are authoritative
            tag.details.uncertain = LongBitmask::new();
        }
        self.start_tagging_job_if_needed();
        Ok(())
    }

    fn remove_converter_locked(&mut self, name: &str) -> ManagerResult<()> {
        let converter = self
            .converters
            .get(name)
            .cloned()
            .ok_or_else(|| ManagerError::UnknownConverter(name.to_string()))?;
        let tag_names: Vec<String> = self.tags.keys().cloned().collect();
        for tag_name in tag_names {
            if let Some(tag) = self.tags.get_mut(&tag_name) {
                if let Some(position) = tag
                    .converters
                    .iter()
                    .position(|c| same_converter(c, &converter))
                {
                    tag.converters.remove(position);
                    if let Err(e) = converter.detach_tag(&tag_name) {
                        tracing::warn!(tag = %tag_name, converter = %name, error = %e, "detach failed");
                    }
                }
            }
        }
        converter.kill()?;
        self.converters.remove(name);
        Ok(())
    }

    /// Mark streams whose membership must be recomputed after an import.
    pub(crate) fn invalidate_tags(&mut self, updated: &LongBitmask, added: &LongBitmask) {
        let all_streams = self.all_streams.clone();
        for tag in self.tags.values_mut() {
            if !tag.features.sub_query_features.is_empty() {
                // conservative: any sub-query use re-evaluates everything
                tag.details.uncertain = all_streams.clone();
            } else if tag
                .features
                .main_features
                .without(FeatureFlags::FILTER_ID)
                .is_empty()
            {
                continue;
            } else {
                tag.details.uncertain.or(added);
                if tag.features.main_features.intersects(
                    FeatureFlags::FILTER_DATA
                        | FeatureFlags::FILTER_TIME_ABSOLUTE
                        | FeatureFlags::FILTER_TIME_RELATIVE,
                ) {
                    tag.details.uncertain.or(updated);
                }
            }
        }
        self.inherit_tag_uncertainty();
    }

    /// Propagate uncertainty along the tag dependency DAG, dependencies
    /// first.
    pub(crate) fn inherit_tag_uncertainty(&mut self) {
        let mut resolved: Vec<String> = Vec::new();
        while resolved.len() != self.tags.len() {
            let mut progressed = false;
            let mut names: Vec<String> = self.tags.keys().cloned().collect();
            names.sort();
            'outer: for name in names {
                if resolved.contains(&name) {
                    continue;
                }
                let Some(tag) = self.tags.get(&name) else {
                    continue;
                };
                for referenced in tag.referenced_tags() {
                    if !resolved.iter().any(|r| r == referenced) {
                        continue 'outer;
                    }
                }
                resolved.push(name.clone());
                progressed = true;
                let main_tags = tag.features.main_tags.clone();
                let sub_query_tags = tag.features.sub_query_tags.clone();
                if main_tags.is_empty() && sub_query_tags.is_empty() {
                    continue;
                }
                let fully_invalidated = sub_query_tags.iter().any(|r| {
                    self.tags
                        .get(r)
                        .is_some_and(|t| !t.details.uncertain.is_zero())
                });
                let new_uncertain = if fully_invalidated {
                    self.all_streams.clone()
                } else {
                    let mut uncertain = self
                        .tags
                        .get(&name)
                        .map(|t| t.details.uncertain.clone())
                        .unwrap_or_default();
                    for referenced in &main_tags {
                        if let Some(t) = self.tags.get(referenced) {
                            uncertain.or(&t.details.uncertain);
                        }
                    }
                    uncertain
                };
                if let Some(tag) = self.tags.get_mut(&name) {
                    tag.details.uncertain = new_uncertain;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Pick any fully-unblocked uncertain tag and evaluate it.
    pub(crate) fn start_tagging_job_if_needed(&mut self) {
        if self.tagging_job_running {
            return;
        }
        let mut names: Vec<&String> = self.tags.keys().collect();
        names.sort();
        let mut chosen = None;
        'outer: for name in names {
            let Some(tag) = self.tags.get(name) else {
                continue;
            };
            if tag.details.uncertain.is_zero() {
                continue;
            }
            for referenced in tag.referenced_tags() {
                if self
                    .tags
                    .get(referenced)
                    .is_some_and(|t| !t.details.uncertain.is_zero())
                {
                    continue 'outer;
                }
            }
            chosen = Some(name.clone());
            break;
        }
        let Some(name) = chosen else {
            return;
        };
        let Some(tag) = self.tags.get(&name).cloned() else {
            return;
        };
        let tag_details: HashMap<String, TagDetails> = tag
            .referenced_tags()
            .filter_map(|r| self.tags.get(r).map(|t| (r.to_string(), t.details.clone())))
            .collect();
        self.updated_streams_during_tagging_job = LongBitmask::new();
        self.added_streams_during_tagging_job = LongBitmask::new();
        self.tagging_job_running = true;
        let (indexes, releaser) = self.indexes_copy(0);
        let jobs = self.jobs.clone();
        let converters = self.converters.clone();
        tokio::task::spawn_blocking(move || {
            update_tag_job(jobs, name, tag, tag_details, indexes, converters, releaser)
        });
    }

    /// Merge once every tag is settled: find the first mergeable index
    /// smaller than everything after it.
    pub(crate) fn start_merge_job_if_needed(&mut self) {
        if self.merge_job_running || self.tagging_job_running {
            return;
        }
        // merging renumbers files on disk; stale tag bitmasks must not exist
        if self.tags.values().any(|t| !t.details.uncertain.is_zero()) {
            return;
        }
        let mut n_streams = self.n_streams;
        for i in 0..self.indexes.len() {
            let count = self.indexes[i].stream_count();
            n_streams -= count;
            if i >= self.n_unmergeable_indexes && count < n_streams {
                self.merge_job_running = true;
                let (indexes, releaser) = self.indexes_copy(i);
                let jobs = self.jobs.clone();
                let index_dir = self.config.index_dir.clone();
                tokio::task::spawn_blocking(move || {
                    merge_indexes_job(jobs, index_dir, i, indexes, releaser)
                });
                return;
            }
        }
    }

    pub(crate) fn spawn_import_job(&mut self) {
        let filenames = self.import_jobs.clone();
        let (indexes, releaser) = self.indexes_copy(0);
        let jobs = self.jobs.clone();
        let builder = self.builder.clone();
        let pcap_dir = self.config.pcap_dir.clone();
        let next_stream_id = self.next_stream_id;
        tokio::task::spawn_blocking(move || {
            import_pcap_job(
                jobs,
                builder,
                pcap_dir,
                filenames,
                next_stream_id,
                indexes,
                releaser,
            )
        });
    }

    /// Feed a tag's settled matches to each of its converters.
    pub(crate) fn delegate_tag_matches(&mut self, name: &str) {
        let Some(tag) = self.tags.get(name) else {
            return;
        };
        if tag.converters.is_empty() {
            return;
        }
        let mut matching = tag.details.matches.clone();
        matching.sub(&tag.details.uncertain);
        let stream_ids: Vec<u64> = matching.iter_ones().collect();
        if stream_ids.is_empty() {
            return;
        }
        let converters = tag.converters.clone();
        for converter in converters {
            let (indexes, releaser) = self.indexes_copy(0);
            let jobs = self.jobs.clone();
            let stream_ids = stream_ids.clone();
            tokio::task::spawn_blocking(move || {
                delegate_streams_job(jobs, converter, stream_ids, indexes, releaser)
            });
        }
    }
}

/// Attach a converter to a tag, deduplicated by identity.
fn attach_converter_to_tag(tag: &mut Tag, tag_name: &str, converter: &ConverterHandle) -> bool {
    if tag.converters.iter().any(|c| same_converter(c, converter)) {
        return false;
    }
    tag.converters.push(converter.clone());
    converter.attach_tag(tag_name);
    true
}

/// Find a stream's record, newest index first.
pub(crate) fn stream_record(indexes: &[Arc<IndexReader>], stream_id: u64) -> Option<&StreamRecord> {
    indexes
        .iter()
        .rev()
        .find_map(|index| index.stream_by_id(stream_id))
}

fn import_pcap_job(
    jobs: mpsc::UnboundedSender<Job>,
    builder: Arc<dyn IndexBuilder>,
    pcap_dir: PathBuf,
    filenames: Vec<String>,
    next_stream_id: u64,
    existing: Vec<Arc<IndexReader>>,
    releaser: IndexReleaser,
) {
    let (processed, created) = match builder.from_pcap(&pcap_dir, &filenames, &existing) {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(files = ?filenames, error = %e, "import job failed");
            // skip the failing head of the queue to avoid a retry loop
            (1, Vec::new())
        }
    };
    let mut updated_streams = LongBitmask::new();
    let mut added_streams = LongBitmask::new();
    let mut new_stream_count = 0;
    let mut new_packet_count = 0;
    let mut new_next_stream_id = next_stream_id;
    for index in &created {
        new_stream_count += index.stream_count();
        new_packet_count += index.packet_count();
        if index.stream_count() > 0 {
            new_next_stream_id = new_next_stream_id.max(index.max_stream_id() + 1);
        }
        for stream_id in index.stream_ids() {
            if stream_id < next_stream_id {
                updated_streams.set(stream_id);
            } else {
                added_streams.set(stream_id);
            }
        }
    }
    let all_streams = LongBitmask::all_below(new_next_stream_id);
    let _ = jobs.send(Box::new(move |state| {
        state.all_streams = all_streams;
        releaser.release(state);
        if !created.is_empty() {
            state.indexes.extend(created.iter().cloned());
            state.n_streams += new_stream_count;
            state.n_packets += new_packet_count;
            state.next_stream_id = new_next_stream_id;
            state.lock(&created);
            state.added_streams_during_tagging_job.or(&added_streams);
            state
                .updated_streams_during_tagging_job
                .or(&updated_streams);
            state.invalidate_tags(&updated_streams, &added_streams);
        }
        let drained = processed.min(state.import_jobs.len());
        state.import_jobs.drain(..drained);
        if !state.import_jobs.is_empty() {
            state.spawn_import_job();
        }
        state.start_tagging_job_if_needed();
        state.start_merge_job_if_needed();
        state.save_state_logged();
    }));
}

fn merge_indexes_job(
    jobs: mpsc::UnboundedSender<Job>,
    index_dir: PathBuf,
    offset: usize,
    indexes: Vec<Arc<IndexReader>>,
    releaser: IndexReleaser,
) {
    let merged = match merge(&index_dir, &indexes) {
        Ok(merged) => merged,
        Err(e) => {
            tracing::error!(offset, error = %e, "merge job failed");
            Vec::new()
        }
    };
    let mut streams_diff: i64 = 0;
    let mut packets_diff: i64 = 0;
    for index in &merged {
        streams_diff += index.stream_count() as i64;
        packets_diff += index.packet_count() as i64;
    }
    for index in &indexes {
        streams_diff -= index.stream_count() as i64;
        packets_diff -= index.packet_count() as i64;
    }
    let count = indexes.len();
    let _ = jobs.send(Box::new(move |state| {
        if merged.is_empty() {
            state.n_unmergeable_indexes += 1;
        } else {
            let replaced: Vec<Arc<IndexReader>> = state.indexes[offset..offset + count].to_vec();
            IndexReleaser::new(replaced).release(state);
            state.lock(&merged);
            state
                .indexes
                .splice(offset..offset + count, merged.iter().cloned());
            state.n_unmergeable_indexes += merged.len() - 1;
            state.n_streams = (state.n_streams as i64 + streams_diff) as usize;
            state.n_packets = (state.n_packets as i64 + packets_diff) as u64;
        }
        state.merge_job_running = false;
        state.start_merge_job_if_needed();
        releaser.release(state);
    }));
}

fn update_tag_job(
    jobs: mpsc::UnboundedSender<Job>,
    name: String,
    mut tag: Tag,
    tag_details: HashMap<String, TagDetails>,
    indexes: Vec<Arc<IndexReader>>,
    converters: HashMap<String, ConverterHandle>,
    releaser: IndexReleaser,
) {
    let result: ManagerResult<Vec<StreamMatch>> = (|| {
        let query = parse_query(&tag.definition)?;
        let (matches, _) = search_streams(
            &indexes,
            &converters,
            Some(&tag.details.uncertain),
            query.reference_time,
            &query.conditions,
            None,
            &Sorting::id_ascending(),
            0,
            0,
            &tag_details,
        )?;
        Ok(matches)
    })();
    match result {
        Ok(matches) => {
            let mut new_matches = tag.details.matches.clone();
            new_matches.sub(&tag.details.uncertain);
            for m in &matches {
                new_matches.set(m.stream_id);
                for converter in &tag.converters {
                    if !converter.has_stream(m.stream_id) {
                        if let Some(record) = stream_record(&indexes, m.stream_id) {
                            converter.enqueue_stream(record);
                        }
                    }
                }
            }
            tag.details.matches = new_matches;
        }
        Err(e) => {
            // reset to empty instead of livelocking on a broken tag
            tracing::warn!(tag = %name, error = %e, "tag evaluation failed");
            tag.details.matches = LongBitmask::new();
        }
    }
    tag.details.uncertain = LongBitmask::new();
    let _ = jobs.send(Box::new(move |state| {
        // discard the result if the tag changed while the job ran
        let unchanged = state
            .tags
            .get(&name)
            .is_some_and(|existing| existing.definition == tag.definition);
        if unchanged {
            state.tags.insert(name, tag);
            if !(state.updated_streams_during_tagging_job.is_zero()
                && state.added_streams_during_tagging_job.is_zero())
            {
                let updated = state.updated_streams_during_tagging_job.clone();
                let added = state.added_streams_during_tagging_job.clone();
                state.invalidate_tags(&updated, &added);
            }
        }
        state.tagging_job_running = false;
        state.start_tagging_job_if_needed();
        state.start_merge_job_if_needed();
        releaser.release(state);
    }));
}

fn delegate_streams_job(
    jobs: mpsc::UnboundedSender<Job>,
    converter: ConverterHandle,
    stream_ids: Vec<u64>,
    indexes: Vec<Arc<IndexReader>>,
    releaser: IndexReleaser,
) {
    for stream_id in stream_ids {
        match stream_record(&indexes, stream_id) {
            Some(record) => {
                if !converter.has_stream(stream_id) {
                    converter.enqueue_stream(record);
                }
            }
            None => {
                tracing::warn!(converter = %converter.name(), stream_id, "stream not found for delegation");
            }
        }
    }
    let _ = jobs.send(Box::new(move |state| {
        releaser.release(state);
    }));
}
