//! Collaborator traits the dispatch core persists through.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::model::{Account, DispatchOutcome, ForwardTarget};

/// Read-only view of configured accounts and forward targets.
#[async_trait]
pub trait Directory: Send + Sync {
    /// All accounts currently enabled. Read fresh on every call.
    async fn list_active_accounts(&self) -> Result<Vec<Account>, DatabaseError>;

    /// Exact, case-sensitive lookup by target name.
    async fn lookup_target(&self, name: &str) -> Result<Option<ForwardTarget>, DatabaseError>;
}

/// Durable record of dispatch outcomes.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn find_outcome(
        &self,
        account_id: i64,
        message_id: &str,
    ) -> Result<Option<DispatchOutcome>, DatabaseError>;

    /// Insert unless an outcome for the same (account, message) exists.
    ///
    /// Returns `false` when the row was already present.
    async fn append_outcome(&self, outcome: &DispatchOutcome) -> Result<bool, DatabaseError>;
}
