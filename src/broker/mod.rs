pub mod duckdb;
pub mod traits;

pub use self::duckdb::DuckDbBroker;
pub use traits::{Broker, BrokerError, EntryId, EntryStatus, RawMessage, StartPosition};
