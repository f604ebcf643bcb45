//! Converter interface
//!
//! A converter is an external program producing a transformed view of a
//! stream's bytes (decoded TLS, decompressed HTTP bodies, ...). The
//! process supervision lives outside this crate; the core talks to a
//! converter only through this trait and compares converters by identity
//! when deduplicating tag attachments.

use crate::index::types::{IndexResult, StreamRecord};
use std::sync::Arc;

/// Name of the pseudo-converter selecting the raw stream bytes.
pub const RAW_CONVERTER: &str = "none";

/// Transformed stream data in the same shape the raw data section uses.
#[derive(Debug, Clone, Default)]
pub struct ConverterSearchData {
    /// `buffers[0]` client-to-server, `buffers[1]` server-to-client
    pub buffers: [Vec<u8>; 2],
    /// Cumulative byte totals at every directional handover, starting `[0, 0]`
    pub buffer_lengths: Vec<[usize; 2]>,
    pub client_bytes: u64,
    pub server_bytes: u64,
    /// False when the converter has not produced this stream yet; the
    /// search must then treat the stream as not matching on this converter
    pub was_cached: bool,
}

/// Contract between the core and one converter process.
pub trait Converter: Send + Sync {
    fn name(&self) -> &str;

    /// Record that a tag now feeds streams to this converter.
    fn attach_tag(&self, tag_name: &str);

    /// Remove a tag's association.
    fn detach_tag(&self, tag_name: &str) -> IndexResult<()>;

    /// Queue a stream for conversion; duplicates are the caller's concern.
    fn enqueue_stream(&self, record: &StreamRecord);

    /// True if the converter's cache already holds this stream.
    fn has_stream(&self, stream_id: u64) -> bool;

    /// Fetch the converted view of a stream for searching.
    fn data_for_search(&self, stream_id: u64) -> IndexResult<ConverterSearchData>;

    /// Drop the cache and restart the process.
    fn reset(&self) -> IndexResult<()>;

    /// Stop the process for good.
    fn kill(&self) -> IndexResult<()>;

    fn is_running(&self) -> bool;
}

/// Shared handle to a converter; clones refer to the same instance.
pub type ConverterHandle = Arc<dyn Converter>;

/// Identity comparison for attachment deduplication.
pub fn same_converter(a: &ConverterHandle, b: &ConverterHandle) -> bool {
    Arc::ptr_eq(a, b)
}
