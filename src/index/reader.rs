//! Immutable index reader
//!
//! An index is opened once, its header parsed and checksum-verified, and
//! from then on only the data section is touched, through short-lived
//! buffered readers. Deleting a superseded index is therefore just
//! removing its file once the last holder lets go.

use crate::index::types::{IndexError, IndexResult, StreamRecord};
use crate::index::writer::{IndexHeader, INDEX_MAGIC};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Parsed header plus the data section location of one index file.
#[derive(Debug)]
pub struct IndexReader {
    path: PathBuf,
    streams: Vec<StreamRecord>,
    by_id: HashMap<u64, usize>,
    packet_count: u64,
    max_stream_id: u64,
    reference_time: DateTime<Utc>,
    data_section_start: u64,
}

impl IndexReader {
    /// Open and validate an index file.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = BufReader::new(File::open(&path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(IndexError::Corruption(format!(
                "{}: bad magic",
                path.display()
            )));
        }
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        let mut header_bytes = vec![0u8; header_len];
        reader.read_exact(&mut header_bytes)?;
        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
            return Err(IndexError::Corruption(format!(
                "{}: header checksum mismatch",
                path.display()
            )));
        }
        let header: IndexHeader = bincode::deserialize(&header_bytes)?;
        let data_section_start = (4 + 4 + header_len + 4) as u64;

        let mut by_id = HashMap::with_capacity(header.streams.len());
        let mut max_stream_id = 0;
        for (idx, record) in header.streams.iter().enumerate() {
            by_id.insert(record.stream_id, idx);
            max_stream_id = max_stream_id.max(record.stream_id);
        }
        Ok(Self {
            path,
            streams: header.streams,
            by_id,
            packet_count: header.packet_count,
            max_stream_id,
            reference_time: header.reference_time,
            data_section_start,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Largest stream ID present; meaningless when the index is empty.
    pub fn max_stream_id(&self) -> u64 {
        self.max_stream_id
    }

    /// Earliest first-packet time over all streams.
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn contains_stream(&self, stream_id: u64) -> bool {
        self.by_id.contains_key(&stream_id)
    }

    /// IDs of all streams in this index, unordered.
    pub fn stream_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_id.keys().copied()
    }

    pub fn stream_by_id(&self, stream_id: u64) -> Option<&StreamRecord> {
        self.by_id.get(&stream_id).map(|&idx| &self.streams[idx])
    }

    /// All stream records in ascending stream-ID order.
    pub fn all_streams(&self) -> impl Iterator<Item = &StreamRecord> {
        self.streams.iter()
    }

    /// Open a fresh reader over the data section.
    pub fn data_section_reader(&self) -> IndexResult<DataSectionReader> {
        Ok(DataSectionReader {
            reader: BufReader::new(File::open(&self.path)?),
            section_start: self.data_section_start,
        })
    }
}

/// Buffered, seekable access to an index's data section.
pub struct DataSectionReader {
    reader: BufReader<File>,
    section_start: u64,
}

/// The directional payloads of one stream plus the cumulative byte counts
/// at every directional handover boundary.
pub struct StreamPayload {
    /// `buffers[0]` is client-to-server data, `buffers[1]` server-to-client
    pub buffers: [Vec<u8>; 2],
    /// Cumulative `(c2s, s2c)` totals, starting at `[0, 0]`
    pub buffer_lengths: Vec<[usize; 2]>,
}

impl DataSectionReader {
    /// Read a stream's directional buffers and chunk boundary table.
    pub fn stream_payload(&mut self, record: &StreamRecord) -> IndexResult<StreamPayload> {
        self.reader
            .seek(SeekFrom::Start(self.section_start + record.data_start))?;
        let mut buffers = [
            vec![0u8; record.client_bytes as usize],
            vec![0u8; record.server_bytes as usize],
        ];
        self.reader.read_exact(&mut buffers[0])?;
        self.reader.read_exact(&mut buffers[1])?;

        let totals = [record.client_bytes as usize, record.server_bytes as usize];
        let mut buffer_lengths = vec![[0usize; 2]];
        let mut dir = 0;
        loop {
            let last = buffer_lengths[buffer_lengths.len() - 1];
            if last[0] == totals[0] && last[1] == totals[1] {
                break;
            }
            let size = self.read_varint()?;
            if size != 0 {
                let mut next = last;
                next[dir] += size as usize;
                if next[dir] > totals[dir] {
                    return Err(IndexError::Corruption(format!(
                        "stream {}: chunk sizes exceed direction total",
                        record.stream_id
                    )));
                }
                buffer_lengths.push(next);
            }
            dir ^= 1;
        }
        Ok(StreamPayload {
            buffers,
            buffer_lengths,
        })
    }

    fn read_varint(&mut self) -> IndexResult<u64> {
        let mut value = 0u64;
        loop {
            let mut byte = [0u8; 1];
            self.reader.read_exact(&mut byte)?;
            value <<= 7;
            value |= (byte[0] & 0x7f) as u64;
            if byte[0] < 128 {
                return Ok(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::{Protocol, StreamChunk, StreamEntry};
    use crate::index::writer::write_index_file;
    use crate::query::Direction;

    fn entry(stream_id: u64, chunks: Vec<(Direction, &[u8])>) -> StreamEntry {
        StreamEntry {
            stream_id,
            client_host: "10.0.0.1".to_string(),
            server_host: "10.0.0.2".to_string(),
            client_port: 40000,
            server_port: 80,
            protocol: Protocol::Tcp,
            first_packet_time: Utc::now(),
            last_packet_time: Utc::now(),
            packet_count: chunks.len() as u64,
            chunks: chunks
                .into_iter()
                .map(|(direction, data)| StreamChunk {
                    direction,
                    data: data.to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_roundtrip_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.fdx");
        write_index_file(
            &path,
            &[
                entry(3, vec![(Direction::ClientToServer, b"hello")]),
                entry(7, vec![(Direction::ServerToClient, b"world")]),
            ],
        )
        .unwrap();

        let reader = IndexReader::open(&path).unwrap();
        assert_eq!(reader.stream_count(), 2);
        assert_eq!(reader.max_stream_id(), 7);
        assert!(reader.contains_stream(3));
        assert!(!reader.contains_stream(4));
        let record = reader.stream_by_id(3).unwrap();
        assert_eq!(record.client_bytes, 5);
        assert_eq!(record.server_bytes, 0);
    }

    #[test]
    fn test_stream_payload_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.fdx");
        write_index_file(
            &path,
            &[entry(
                0,
                vec![
                    (Direction::ClientToServer, b"user=alice\n"),
                    (Direction::ServerToClient, b"ok\n"),
                    (Direction::ClientToServer, b"quit\n"),
                ],
            )],
        )
        .unwrap();

        let reader = IndexReader::open(&path).unwrap();
        let mut data = reader.data_section_reader().unwrap();
        let payload = data
            .stream_payload(reader.stream_by_id(0).unwrap())
            .unwrap();
        assert_eq!(payload.buffers[0], b"user=alice\nquit\n");
        assert_eq!(payload.buffers[1], b"ok\n");
        assert_eq!(
            payload.buffer_lengths,
            vec![[0, 0], [11, 0], [11, 3], [16, 3]]
        );
    }

    #[test]
    fn test_consecutive_same_direction_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.fdx");
        write_index_file(
            &path,
            &[entry(
                1,
                vec![
                    (Direction::ServerToClient, b"banner\n"),
                    (Direction::ServerToClient, b"more\n"),
                    (Direction::ClientToServer, b"hi\n"),
                ],
            )],
        )
        .unwrap();

        let reader = IndexReader::open(&path).unwrap();
        let mut data = reader.data_section_reader().unwrap();
        let payload = data
            .stream_payload(reader.stream_by_id(1).unwrap())
            .unwrap();
        assert_eq!(payload.buffers[0], b"hi\n");
        assert_eq!(payload.buffers[1], b"banner\nmore\n");
        // the two server chunks were emitted in separate turns
        assert_eq!(
            payload.buffer_lengths,
            vec![[0, 0], [0, 7], [0, 12], [3, 12]]
        );
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.fdx");
        write_index_file(&path, &[entry(0, vec![(Direction::ClientToServer, b"x")])]).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(IndexReader::open(&path).is_err());
    }
}
