pub mod duckdb;
pub mod query;
pub mod traits;

pub use self::duckdb::DuckDbStorage;
pub use query::{OrderBy, PaginationInfo, SearchQuery, SearchResults};
pub use traits::{LogStatistics, RecordSink, Storage, StorageError};
