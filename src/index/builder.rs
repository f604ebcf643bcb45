//! Index builder interface
//!
//! The capture-file parser lives outside this crate; the import driver
//! hands it pending filenames plus the current index snapshot and gets
//! back freshly written indexes. Implementations keep their own record of
//! which capture files were already processed.

use crate::index::reader::IndexReader;
use crate::index::types::{IndexResult, PcapInfo};
use std::path::Path;
use std::sync::Arc;

/// Contract between the import driver and the external index builder.
pub trait IndexBuilder: Send + Sync {
    /// Process pending capture files.
    ///
    /// Returns how many of `filenames` were consumed (from the front) and
    /// the indexes created for them. A re-indexed stream may appear again
    /// in a created index with an ID below the caller's `next_stream_id`.
    fn from_pcap(
        &self,
        pcap_dir: &Path,
        filenames: &[String],
        existing: &[Arc<IndexReader>],
    ) -> IndexResult<(usize, Vec<Arc<IndexReader>>)>;

    /// Metadata of every capture file processed so far.
    fn known_pcaps(&self) -> Vec<PcapInfo>;

    /// Seed the processed-file record from persisted state.
    fn set_known_pcaps(&self, cached: Vec<PcapInfo>);
}
