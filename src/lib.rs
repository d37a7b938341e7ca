//! Async CQL driver for the ScyllaDB database, with shard-aware routing.
//!
//! The driver opens and maintains connections to every cluster member,
//! routes each statement to a node (and, when possible, to the very shard)
//! that owns the data, multiplexes many concurrent requests over each
//! connection, retries on transient failures and streams paged result sets
//! back to callers.
//!
//! ```rust,no_run
//! use stingray::{SerializedValues, Session, SessionConfig};
//!
//! # async fn check_only_compiles() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = SessionConfig::new();
//! config.hosts = vec!["127.0.0.1:9042".to_string()];
//!
//! let session = Session::connect(config).await?;
//!
//! let result = session
//!     .query("SELECT key FROM system.local", &SerializedValues::new())
//!     .await?;
//! println!("{} row(s)", result.rows_num());
//! # Ok(())
//! # }
//! ```

pub mod frame;
pub mod routing;
pub mod statement;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_utils;

pub use statement::prepared_statement::PreparedStatement;
pub use statement::query::Query;
pub use statement::{Consistency, SerialConsistency};

pub use frame::server_event_type::EventType;
pub use frame::value::SerializedValues;
pub use frame::Compression;

pub use transport::errors::{BadQuery, DbError, NewSessionError, QueryError};
pub use transport::iterator::RowIterator;
pub use transport::load_balancing::{
    DcAwareRoundRobinPolicy, HostSelectionPolicy, NetworkTopologyTokenAwarePolicy,
    RoundRobinPolicy, SimpleTokenAwarePolicy,
};
pub use transport::query_result::QueryResult;
pub use transport::retry_policy::{
    DefaultRetryPolicy, FallthroughRetryPolicy, RetryDecision, RetryPolicy,
};
pub use transport::session::{Session, SessionConfig};
pub use transport::PoolSize;

pub use routing::Token;
