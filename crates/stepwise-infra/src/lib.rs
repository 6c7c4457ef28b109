//! Infrastructure implementations of the stepwise-core ports.
//!
//! - `sqlite`: durable stores over SQLite (WAL mode, split pools)
//! - `memory`: in-process stores for tests and embedded use
//! - `http`: reqwest-backed outbound HTTP caller
//! - `events`: broadcast-channel event sink

pub mod events;
pub mod http;
pub mod memory;
pub mod sqlite;
