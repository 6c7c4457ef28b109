//! SQLite storage layer.
//!
//! Store implementations backed by SQLite with WAL mode and split
//! read/write connection pools. Records are stored as JSON blobs with a
//! few extracted columns for filtering.

pub mod approval;
pub mod definition;
pub mod document;
pub mod instance;
pub mod pool;
