//! Index artifacts: immutable stream indexes, their writer and merger,
//! and the collaborator contracts for the capture-file builder and the
//! converters.

pub mod builder;
pub mod converter;
pub mod merge;
pub mod reader;
pub mod types;
pub mod writer;

pub use builder::IndexBuilder;
pub use converter::{same_converter, Converter, ConverterHandle, ConverterSearchData, RAW_CONVERTER};
pub use merge::merge;
pub use reader::{DataSectionReader, IndexReader, StreamPayload};
pub use types::{
    IndexError, IndexResult, PcapInfo, Protocol, StreamChunk, StreamEntry, StreamRecord,
};
pub use writer::{next_index_filename, write_index_file};
