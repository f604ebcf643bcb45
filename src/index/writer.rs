//! Index file writer
//!
//! File layout:
//! - magic: `FDIX` (4 bytes)
//! - header length: u32 LE
//! - header: bincode-serialized [`IndexHeader`]
//! - header CRC32: u32 LE
//! - data section: per stream, `client_bytes` of C2S data, `server_bytes`
//!   of S2C data, then the chunk list as varints (7 low bits per byte,
//!   high bit = continuation, MSB group first) alternating direction
//!   starting client-to-server; a zero varint yields the turn without
//!   advancing.

use crate::index::types::{IndexError, IndexResult, StreamEntry, StreamRecord};
use crate::query::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) const INDEX_MAGIC: &[u8; 4] = b"FDIX";

/// Serialized index metadata preceding the data section.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexHeader {
    pub streams: Vec<StreamRecord>,
    pub packet_count: u64,
    pub reference_time: DateTime<Utc>,
}

static FILENAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produce a fresh, unique index filename inside `dir`.
pub fn next_index_filename(dir: &Path) -> PathBuf {
    let seq = FILENAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let micros = Utc::now().timestamp_micros();
    dir.join(format!("{micros}-{seq}.fdx"))
}

/// Write a complete index file from in-memory stream entries.
///
/// Entries are sorted by stream ID; duplicate IDs are rejected.
pub fn write_index_file(path: &Path, entries: &[StreamEntry]) -> IndexResult<()> {
    let mut entries: Vec<&StreamEntry> = entries.iter().collect();
    entries.sort_by_key(|e| e.stream_id);
    for pair in entries.windows(2) {
        if pair[0].stream_id == pair[1].stream_id {
            return Err(IndexError::Corruption(format!(
                "duplicate stream id {} in one index",
                pair[0].stream_id
            )));
        }
    }

    let mut data_section = Vec::new();
    let mut records = Vec::with_capacity(entries.len());
    let mut packet_count = 0u64;
    let mut reference_time: Option<DateTime<Utc>> = None;
    for entry in &entries {
        let data_start = data_section.len() as u64;
        append_stream_data(&mut data_section, entry);
        let (client_bytes, server_bytes) = entry.byte_counts();
        packet_count += entry.packet_count;
        if reference_time.map_or(true, |t| entry.first_packet_time < t) {
            reference_time = Some(entry.first_packet_time);
        }
        records.push(StreamRecord {
            stream_id: entry.stream_id,
            client_host: entry.client_host.clone(),
            server_host: entry.server_host.clone(),
            client_port: entry.client_port,
            server_port: entry.server_port,
            protocol: entry.protocol,
            first_packet_time: entry.first_packet_time,
            last_packet_time: entry.last_packet_time,
            client_bytes,
            server_bytes,
            packet_count: entry.packet_count,
            data_start,
        });
    }

    let header = IndexHeader {
        streams: records,
        packet_count,
        reference_time: reference_time.unwrap_or_default(),
    };
    let header_bytes = bincode::serialize(&header)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes);
    let crc = hasher.finalize();

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(INDEX_MAGIC)?;
    writer.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&header_bytes)?;
    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&data_section)?;
    writer.flush()?;
    Ok(())
}

fn append_stream_data(out: &mut Vec<u8>, entry: &StreamEntry) {
    for wanted in [Direction::ClientToServer, Direction::ServerToClient] {
        for chunk in &entry.chunks {
            if chunk.direction == wanted {
                out.extend_from_slice(&chunk.data);
            }
        }
    }
    // chunk sizes, one varint per turn, starting client-to-server
    let mut turn = Direction::ClientToServer;
    for chunk in &entry.chunks {
        if chunk.data.is_empty() {
            continue;
        }
        while turn != chunk.direction {
            out.push(0);
            turn = turn.flip();
        }
        write_varint(out, chunk.data.len() as u64);
        turn = turn.flip();
    }
}

/// 7-bit groups, most significant first, high bit marks continuation.
fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; 10];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            break;
        }
    }
    for i in (1..n).rev() {
        out.push(groups[i] | 0x80);
    }
    out.push(groups[0]);
}
