//! Search: pattern compilation, query parsing, and index matching

pub mod matcher;
pub mod pattern;
pub mod query;

pub use matcher::{SearchMatcher, SearchResult};
pub use pattern::{QuickSearchPattern, StringSearch};
pub use query::{ItemType, SearchQuery, SizeMode, DEFAULT_MAX_RESULTS};
