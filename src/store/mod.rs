//! Persistence layer — libSQL-backed client store and channel queues.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, OutreachCommit, OutreachKind, ReplyCommit};
