//! # flowdex
//!
//! Packet-capture stream indexing, tagging and search core.
//!
//! Raw capture files are turned into compact immutable stream indexes by
//! an external builder; this crate coordinates those indexes, keeps
//! user-defined *tags* (named, persisted queries) continuously evaluated
//! as data arrives, and answers searches — including regex conditions
//! over the directional bytes of each stream with cross-query variable
//! capture.
//!
//! ## Modules
//!
//! - [`bitmask`]: dense stream-ID bitmask
//! - [`query`]: query language AST and parser
//! - [`index`]: index artifacts plus builder/converter contracts
//! - [`search`]: the stream search engine
//! - [`manager`]: the single-writer tag/index manager
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowdex::{Config, Manager};
//! use std::sync::Arc;
//!
//! # fn builder() -> Arc<dyn flowdex::index::IndexBuilder> { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new(Config::under("data"), builder(), Vec::new())?;
//!
//!     // tag every stream talking to the login service
//!     manager.add_tag("tag/login", "#d33682", r#"cdata:"user=""#).await?;
//!     manager.import_pcap("capture-001.pcap")?;
//!
//!     let tags = manager.list_tags().await?;
//!     println!("{} tags defined", tags.len());
//!     Ok(())
//! }
//! ```

pub mod bitmask;
pub mod config;
pub mod index;
pub mod manager;
pub mod query;
pub mod search;

// Re-export top-level types for convenience
pub use bitmask::LongBitmask;
pub use config::Config;

pub use index::{
    Converter, ConverterHandle, ConverterSearchData, IndexBuilder, IndexError, IndexReader,
    IndexResult, PcapInfo, StreamRecord,
};

pub use manager::{
    Manager, ManagerError, ManagerResult, Statistics, StreamsOptions, TagInfo, UpdateTagOperation,
    View,
};

pub use query::{parse_query, Query, QueryError, TagDetails};

pub use search::{search_streams, SearchError, StreamMatch};
