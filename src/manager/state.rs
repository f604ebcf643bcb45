//! Manager state persistence
//!
//! Tags and known-capture metadata are serialized to JSON. Every save
//! writes a fresh file and then unlinks the previous one, so a crash
//! between the two leaves at most one extra file; loading scans the
//! state directory and the latest valid file wins. A file containing any
//! invalid tag is skipped whole — data integrity over partial recovery.

use crate::index::{ConverterHandle, PcapInfo};
use crate::manager::tag::{is_mark_name, Tag};
use crate::query::{parse_query, TagDetails};
use crate::bitmask::LongBitmask;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const STATE_SUFFIX: &str = ".state.json";

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    saved: DateTime<Utc>,
    tags: Vec<StateFileTag>,
    pcaps: Vec<PcapInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFileTag {
    name: String,
    definition: String,
    color: String,
    converters: Vec<String>,
}

/// The outcome of a successful state load.
pub(crate) struct LoadedState {
    pub filename: PathBuf,
    pub tags: HashMap<String, Tag>,
    pub pcaps: Vec<PcapInfo>,
}

static FILENAME_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_state_filename(state_dir: &Path) -> PathBuf {
    let seq = FILENAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let micros = Utc::now().timestamp_micros();
    state_dir.join(format!("{micros}-{seq}{STATE_SUFFIX}"))
}

/// Write the current state to a fresh file and unlink the prior one.
pub(crate) fn save_state(
    state_dir: &Path,
    prior: Option<&Path>,
    tags: &HashMap<String, Tag>,
    pcaps: &[PcapInfo],
) -> std::io::Result<PathBuf> {
    let mut tag_entries: Vec<StateFileTag> = tags
        .iter()
        .map(|(name, tag)| StateFileTag {
            name: name.clone(),
            definition: tag.definition.clone(),
            color: tag.color.clone(),
            converters: tag.converter_names(),
        })
        .collect();
    tag_entries.sort_by(|a, b| a.name.cmp(&b.name));
    let state = StateFile {
        saved: Utc::now(),
        tags: tag_entries,
        pcaps: pcaps.to_vec(),
    };
    let filename = next_state_filename(state_dir);
    let file = File::create(&filename)?;
    serde_json::to_writer(BufWriter::new(file), &state)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    if let Some(prior) = prior {
        if let Err(e) = std::fs::remove_file(prior) {
            tracing::warn!(file = %prior.display(), error = %e, "unable to delete old state file");
        }
    }
    Ok(filename)
}

/// Load the latest valid state file, if any.
///
/// Every tag starts fully uncertain except marks, whose `id:` filter
/// yields concrete matches. Tags referencing missing converters, missing
/// tags, themselves, or forming a cycle invalidate the whole file.
pub(crate) fn load_state(
    state_dir: &Path,
    converters: &HashMap<String, ConverterHandle>,
    all_streams: &LongBitmask,
    next_stream_id: u64,
) -> Option<LoadedState> {
    let mut filenames = Vec::new();
    let entries = match std::fs::read_dir(state_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %state_dir.display(), error = %e, "unable to list state directory");
            return None;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(STATE_SUFFIX))
        {
            filenames.push(path);
        }
    }
    filenames.sort();

    let mut best: Option<(DateTime<Utc>, PathBuf, StateFile)> = None;
    for filename in filenames {
        let file = match File::open(&filename) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(file = %filename.display(), error = %e, "unable to open state file");
                continue;
            }
        };
        let state: StateFile = match serde_json::from_reader(BufReader::new(file)) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(file = %filename.display(), error = %e, "unable to parse state file");
                continue;
            }
        };
        if best.as_ref().is_some_and(|(saved, _, _)| state.saved < *saved) {
            continue;
        }
        if validate_state(&state, &filename, converters) {
            best = Some((state.saved, filename, state));
        }
    }

    let (_, filename, state) = best?;
    let mut tags = HashMap::with_capacity(state.tags.len());
    for entry in &state.tags {
        // validate_state already vetted everything below
        let query = parse_query(&entry.definition).ok()?;
        let features = query.conditions.features();
        let mut tag = Tag {
            details: TagDetails {
                matches: LongBitmask::new(),
                uncertain: all_streams.clone(),
                conditions: query.conditions.clone(),
            },
            definition: entry.definition.clone(),
            features,
            color: entry.color.clone(),
            converters: Vec::new(),
        };
        if is_mark_name(&entry.name) {
            tag.details.matches = query.conditions.stream_ids(next_stream_id)?;
            tag.details.uncertain = LongBitmask::new();
        }
        for converter_name in &entry.converters {
            let converter = converters.get(converter_name)?;
            tag.converters.push(converter.clone());
            converter.attach_tag(&entry.name);
        }
        tags.insert(entry.name.clone(), tag);
    }
    Some(LoadedState {
        filename,
        tags,
        pcaps: state.pcaps,
    })
}

/// Check one state file in full; any invalid tag rejects the file.
fn validate_state(
    state: &StateFile,
    filename: &Path,
    converters: &HashMap<String, ConverterHandle>,
) -> bool {
    let mut referenced: HashMap<String, Vec<String>> = HashMap::new();
    for entry in &state.tags {
        let query = match parse_query(&entry.definition) {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!(file = %filename.display(), tag = %entry.name, error = %e, "invalid tag in state file");
                return false;
            }
        };
        if referenced.contains_key(&entry.name) {
            tracing::warn!(file = %filename.display(), tag = %entry.name, "duplicate tag name in state file");
            return false;
        }
        if is_mark_name(&entry.name) && query.conditions.stream_ids(0).is_none() {
            tracing::warn!(file = %filename.display(), tag = %entry.name, "malformed mark tag in state file");
            return false;
        }
        for converter_name in &entry.converters {
            if !converters.contains_key(converter_name) {
                tracing::warn!(
                    file = %filename.display(),
                    tag = %entry.name,
                    converter = %converter_name,
                    "tag references non-existing converter"
                );
                return false;
            }
        }
        let features = query.conditions.features();
        let refs: Vec<String> = features
            .main_tags
            .iter()
            .chain(features.sub_query_tags.iter())
            .cloned()
            .collect();
        referenced.insert(entry.name.clone(), refs);
    }
    for (name, refs) in &referenced {
        for referenced_name in refs {
            if referenced_name == name {
                tracing::warn!(file = %filename.display(), tag = %name, "tag references itself");
                return false;
            }
            if !referenced.contains_key(referenced_name) {
                tracing::warn!(
                    file = %filename.display(),
                    tag = %name,
                    references = %referenced_name,
                    "tag references non-existing tag"
                );
                return false;
            }
        }
    }
    // peel leaves; anything left is part of a cycle
    let mut remaining: HashSet<&str> = referenced.keys().map(String::as_str).collect();
    loop {
        let next = remaining
            .iter()
            .find(|name| {
                referenced[&name.to_string()]
                    .iter()
                    .all(|r| !remaining.contains(r.as_str()))
            })
            .copied();
        match next {
            Some(name) => {
                remaining.remove(name);
            }
            None => break,
        }
    }
    if !remaining.is_empty() {
        tracing::warn!(file = %filename.display(), "state file contains a tag cycle");
        return false;
    }
    true
}
