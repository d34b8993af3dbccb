//! Persistence: directory of accounts and targets, and the dispatch audit log.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{AuditLog, Directory};
