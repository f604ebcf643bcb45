//! Manager error types

use crate::index::IndexError;
use crate::query::QueryError;
use crate::search::SearchError;
use thiserror::Error;

/// Errors surfaced by manager operations
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Tag name lacks a valid prefix or has an empty suffix
    #[error("invalid tag name (need a 'tag/', 'service/', 'mark/' or 'generated/' prefix)")]
    InvalidTagName,

    /// Tag definition failed to parse
    #[error("invalid tag query: {0}")]
    InvalidTagQuery(#[from] QueryError),

    /// Tag definition uses a feature tags cannot carry
    #[error("{0} not allowed in tags")]
    UnsupportedFeature(&'static str),

    /// A tag may not reference itself
    #[error("self reference not allowed in tags")]
    SelfReference,

    /// Mark tags must reduce to a concrete `id:` filter
    #[error("tags of type 'mark' or 'generated' may only contain an 'id' filter")]
    MalformedMark,

    /// No tag with that name exists
    #[error("unknown tag {0:?}")]
    UnknownTag(String),

    /// No converter with that name exists
    #[error("unknown converter {0:?}")]
    UnknownConverter(String),

    /// A referenced stream ID was never assigned
    #[error("unknown stream id {0}")]
    UnknownStreamId(u64),

    /// The tag cannot be deleted while another tag references it
    #[error("tag {0:?} still references the tag to be deleted")]
    TagReferencedByOther(String),

    /// A tag with that name already exists
    #[error("tag already exists")]
    TagAlreadyExists,

    /// The converter is not attached to the tag
    #[error("converter {0:?} not attached to this tag")]
    ConverterNotAttached(String),

    /// The manager task has shut down
    #[error("manager is shut down")]
    ChannelClosed,

    /// Search failure
    #[error(transparent)]
    Search(#[from] SearchError),

    /// Index failure
    #[error(transparent)]
    Index(#[from] IndexError),

    /// I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;
