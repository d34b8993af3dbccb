//! Error types for the mail dispatcher.

/// Error surfaced by one account's poll task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Directory / audit log errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mailbox session errors.
///
/// `Connection` and `Auth` are retried by `Transport::ensure_connection`
/// before being surfaced; the rest surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Session is closed")]
    Closed,
}

impl TransportError {
    /// Whether this error belongs to the connect/login phase.
    pub fn is_connect_phase(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Auth { .. })
    }
}

/// Outbound submission errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Every method in the fallback chain failed. `attempts` holds one
    /// `"<method>: <reason>"` entry per attempt that was made.
    #[error("all delivery methods failed")]
    AllMethodsFailed { attempts: Vec<String> },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("{method} submission to {host}:{port} failed: {reason}")]
    Attempt {
        method: String,
        host: String,
        port: u16,
        reason: String,
    },

    #[error("{0}")]
    Build(String),
}

/// Business-rule failures in the routing engine.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("subject does not match '<keyword> - <target>': {0}")]
    SubjectFormat(String),

    #[error("no forward target named {name}")]
    TargetNotFound { name: String },
}

/// Scheduler lifecycle errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,

    #[error("scheduler has been stopped and cannot be restarted")]
    Stopped,
}
