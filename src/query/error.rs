//! Query error types

use thiserror::Error;

/// Errors produced while parsing or validating queries
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query text could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// A stream ID list contained an invalid entry
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    /// A time bound could not be parsed
    #[error("invalid time bound: {0}")]
    InvalidTime(String),
}

/// Result type alias for query operations
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueryError::Parse("unexpected token".to_string());
        assert_eq!(err.to_string(), "parse error: unexpected token");
    }
}
