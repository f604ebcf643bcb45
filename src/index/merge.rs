//! Index merging
//!
//! Combines a run of adjacent indexes into a single one. Stream IDs may
//! repeat across indexes when a stream was re-indexed; the newest index
//! (last in the slice) wins.

use crate::index::reader::{IndexReader, StreamPayload};
use crate::index::types::{IndexResult, StreamChunk, StreamEntry, StreamRecord};
use crate::index::writer::{next_index_filename, write_index_file};
use crate::query::Direction;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Merge `indexes` into one new index file inside `index_dir`.
pub fn merge(index_dir: &Path, indexes: &[Arc<IndexReader>]) -> IndexResult<Vec<Arc<IndexReader>>> {
    if indexes.is_empty() {
        return Ok(Vec::new());
    }
    // newest index wins for a re-indexed stream
    let mut winner: HashMap<u64, usize> = HashMap::new();
    for (idx_pos, index) in indexes.iter().enumerate() {
        for stream_id in index.stream_ids() {
            winner.insert(stream_id, idx_pos);
        }
    }

    let mut entries = Vec::with_capacity(winner.len());
    for (idx_pos, index) in indexes.iter().enumerate() {
        let mut data = index.data_section_reader()?;
        for record in index.all_streams() {
            if winner.get(&record.stream_id) != Some(&idx_pos) {
                continue;
            }
            let payload = data.stream_payload(record)?;
            entries.push(entry_from_payload(record, payload));
        }
    }

    let path = next_index_filename(index_dir);
    write_index_file(&path, &entries)?;
    Ok(vec![Arc::new(IndexReader::open(&path)?)])
}

/// Rebuild the chunk sequence of a stream from its boundary table.
fn entry_from_payload(record: &StreamRecord, payload: StreamPayload) -> StreamEntry {
    let mut chunks = Vec::with_capacity(payload.buffer_lengths.len().saturating_sub(1));
    for pair in payload.buffer_lengths.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        for direction in [Direction::ClientToServer, Direction::ServerToClient] {
            let d = direction.idx();
            if next[d] > prev[d] {
                chunks.push(StreamChunk {
                    direction,
                    data: payload.buffers[d][prev[d]..next[d]].to_vec(),
                });
            }
        }
    }
    StreamEntry {
        stream_id: record.stream_id,
        client_host: record.client_host.clone(),
        server_host: record.server_host.clone(),
        client_port: record.client_port,
        server_port: record.server_port,
        protocol: record.protocol,
        first_packet_time: record.first_packet_time,
        last_packet_time: record.last_packet_time,
        packet_count: record.packet_count,
        chunks,
    }
}
