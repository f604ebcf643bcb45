//! Core index data types

use crate::query::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from reading or writing index artifacts
#[derive(Error, Debug)]
pub enum IndexError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (bad magic, checksum mismatch, truncated section)
    #[error("corrupt index: {0}")]
    Corruption(String),

    /// Converter-side failure
    #[error("converter error: {0}")]
    Converter(String),
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

/// Result type alias for index operations
pub type IndexResult<T> = Result<T, IndexError>;

/// Transport protocol of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Other,
}

/// Metadata of one bidirectional stream inside an index.
///
/// `data_start` is the stream's byte offset into the index file's data
/// section; the layout there is `client_bytes` of client-to-server data,
/// `server_bytes` of server-to-client data, then the alternating varint
/// chunk list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub stream_id: u64,
    pub client_host: String,
    pub server_host: String,
    pub client_port: u16,
    pub server_port: u16,
    pub protocol: Protocol,
    pub first_packet_time: DateTime<Utc>,
    pub last_packet_time: DateTime<Utc>,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub packet_count: u64,
    pub data_start: u64,
}

/// One directional run of bytes as captured, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub direction: Direction,
    pub data: Vec<u8>,
}

/// Everything needed to write one stream into an index file.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub stream_id: u64,
    pub client_host: String,
    pub server_host: String,
    pub client_port: u16,
    pub server_port: u16,
    pub protocol: Protocol,
    pub first_packet_time: DateTime<Utc>,
    pub last_packet_time: DateTime<Utc>,
    pub packet_count: u64,
    pub chunks: Vec<StreamChunk>,
}

impl StreamEntry {
    /// Total bytes per direction over all chunks.
    pub fn byte_counts(&self) -> (u64, u64) {
        let mut counts = (0u64, 0u64);
        for chunk in &self.chunks {
            match chunk.direction {
                Direction::ClientToServer => counts.0 += chunk.data.len() as u64,
                Direction::ServerToClient => counts.1 += chunk.data.len() as u64,
            }
        }
        counts
    }
}

/// Metadata about an already-imported capture file, persisted in the
/// manager state so imports are not repeated across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcapInfo {
    pub filename: String,
    pub filesize: u64,
    pub packet_count: u64,
    pub first_packet_time: DateTime<Utc>,
    pub last_packet_time: DateTime<Utc>,
}
