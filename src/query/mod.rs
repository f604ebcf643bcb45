//! Query language: AST, parser and derived features

pub mod ast;
pub mod error;
pub mod parser;

pub use ast::{
    Conditions, DataCondition, DataElement, Direction, FeatureFlags, FeatureSet, Filter, Grouping,
    Query, QueryPart, Sorting, SortingDir, SortingKey, TagDetails, Variable, MAIN_PART,
};
pub use error::{QueryError, QueryResult};
pub use parser::parse_query;
