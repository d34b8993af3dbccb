//! libSQL backend for the [`Directory`] and [`AuditLog`] traits.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::model::{Account, DispatchOutcome, ForwardTarget, OutcomeStatus};
use crate::store::migrations;
use crate::store::traits::{AuditLog, Directory};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Register a mailbox. Returns the new account id.
    pub async fn add_account(
        &self,
        address: &str,
        username: &str,
        password: &SecretString,
        server: &str,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "INSERT INTO accounts (address, username, password, server, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 RETURNING id",
                params![address, username, password.expose_secret(), server, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_account: {e}")))?;

        let id = first_id(&mut rows, "add_account").await?;
        debug!(account_id = id, address, "Account added");
        Ok(id)
    }

    /// Enable or disable polling for an account.
    pub async fn set_account_active(&self, id: i64, active: bool) -> Result<(), DatabaseError> {
        let changed = self
            .conn
            .execute(
                "UPDATE accounts SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, i64::from(active), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_account_active: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::Query(format!(
                "set_account_active: no account with id {id}"
            )));
        }
        Ok(())
    }

    /// Register a forward target. Names are unique.
    pub async fn add_target(
        &self,
        name: &str,
        email: &str,
        description: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "INSERT INTO forward_targets (name, email, description, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 RETURNING id",
                params![name, email, opt_text(description), Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_target: {e}")))?;

        let id = first_id(&mut rows, "add_target").await?;
        debug!(target_id = id, name, "Forward target added");
        Ok(id)
    }

    /// Most recent outcomes first.
    pub async fn list_outcomes(&self, limit: u32) -> Result<Vec<DispatchOutcome>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {OUTCOME_COLUMNS} FROM mail_logs ORDER BY id DESC LIMIT ?1"),
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_outcomes: {e}")))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_outcomes: {e}")))?
        {
            outcomes.push(row_to_outcome(&row)?);
        }
        Ok(outcomes)
    }

    /// Delete outcomes recorded more than `keep_days` days ago.
    /// Returns the number of rows removed.
    pub async fn prune_outcomes(&self, keep_days: u32) -> Result<u64, DatabaseError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(keep_days));
        let removed = self
            .conn
            .execute(
                "DELETE FROM mail_logs WHERE created_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_outcomes: {e}")))?;
        info!(removed, keep_days, "Pruned old dispatch outcomes");
        Ok(removed)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const OUTCOME_COLUMNS: &str = "account_id, message_id, subject, from_addr, to_addr, received_at, \
     forward_to, status, error, forwarded_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

async fn first_id(rows: &mut libsql::Rows, op: &str) -> Result<i64, DatabaseError> {
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        .ok_or_else(|| DatabaseError::Query(format!("{op}: no id returned")))?;
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))
}

fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Serialization(format!("account row: {e}"));
    let password: String = row.get(3).map_err(map)?;
    let last_uid: i64 = row.get(6).map_err(map)?;
    let is_active: i64 = row.get(7).map_err(map)?;

    Ok(Account {
        id: row.get(0).map_err(map)?,
        address: row.get(1).map_err(map)?,
        username: row.get(2).map_err(map)?,
        password: SecretString::from(password),
        server: row.get(4).map_err(map)?,
        settings: row.get::<String>(5).ok(),
        last_uid: u32::try_from(last_uid).unwrap_or(0),
        is_active: is_active != 0,
    })
}

fn row_to_target(row: &libsql::Row) -> Result<ForwardTarget, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Serialization(format!("target row: {e}"));
    Ok(ForwardTarget {
        id: row.get(0).map_err(map)?,
        name: row.get(1).map_err(map)?,
        email: row.get(2).map_err(map)?,
        description: row.get::<String>(3).ok(),
    })
}

fn row_to_outcome(row: &libsql::Row) -> Result<DispatchOutcome, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Serialization(format!("outcome row: {e}"));
    let received: String = row.get(5).map_err(map)?;
    let status: String = row.get(7).map_err(map)?;
    let forwarded: Option<String> = row.get(9).ok();

    Ok(DispatchOutcome {
        account_id: row.get(0).map_err(map)?,
        message_id: row.get(1).map_err(map)?,
        subject: row.get(2).map_err(map)?,
        from: row.get(3).map_err(map)?,
        to: row.get(4).map_err(map)?,
        received_at: parse_datetime(&received),
        forward_to: row.get::<String>(6).ok(),
        status: OutcomeStatus::parse(&status).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown outcome status '{status}'"))
        })?,
        error: row.get::<String>(8).ok(),
        forwarded_at: forwarded.as_deref().map(parse_datetime),
    })
}

#[async_trait]
impl Directory for LibSqlBackend {
    async fn list_active_accounts(&self) -> Result<Vec<Account>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, address, username, password, server, settings, last_uid, is_active
                 FROM accounts WHERE is_active = 1 ORDER BY id",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_accounts: {e}")))?;

        let mut accounts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_accounts: {e}")))?
        {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn lookup_target(&self, name: &str) -> Result<Option<ForwardTarget>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, email, description FROM forward_targets WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_target: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("lookup_target: {e}")))?
        {
            Some(row) => Ok(Some(row_to_target(&row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AuditLog for LibSqlBackend {
    async fn find_outcome(
        &self,
        account_id: i64,
        message_id: &str,
    ) -> Result<Option<DispatchOutcome>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OUTCOME_COLUMNS} FROM mail_logs
                     WHERE account_id = ?1 AND message_id = ?2"
                ),
                params![account_id, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_outcome: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_outcome: {e}")))?
        {
            Some(row) => Ok(Some(row_to_outcome(&row)?)),
            None => Ok(None),
        }
    }

    async fn append_outcome(&self, outcome: &DispatchOutcome) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO mail_logs (account_id, message_id, subject, from_addr, to_addr,
                    received_at, forward_to, status, error, forwarded_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (account_id, message_id) DO NOTHING",
                params![
                    outcome.account_id,
                    outcome.message_id.as_str(),
                    outcome.subject.as_str(),
                    outcome.from.as_str(),
                    outcome.to.as_str(),
                    outcome.received_at.to_rfc3339(),
                    opt_text(outcome.forward_to.as_deref()),
                    outcome.status.as_str(),
                    opt_text(outcome.error.as_deref()),
                    opt_text(outcome.forwarded_at.map(|t| t.to_rfc3339()).as_deref()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_outcome: {e}")))?;

        debug!(
            account_id = outcome.account_id,
            message_id = %outcome.message_id,
            status = outcome.status.as_str(),
            inserted = inserted > 0,
            "Outcome recorded"
        );
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NormalizedMessage;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn message(id: &str) -> NormalizedMessage {
        NormalizedMessage {
            message_id: id.into(),
            subject: "报警 - 张三".into(),
            from: "alice@example.com".into(),
            to: "ops@example.com".into(),
            received_at: Utc::now(),
            raw: None,
            body: None,
        }
    }

    #[tokio::test]
    async fn accounts_round_trip_and_toggle() {
        let db = test_db().await;
        let pw = SecretString::from("secret".to_string());
        let a = db
            .add_account("a@example.com", "a@example.com", &pw, "imap.example.com")
            .await
            .unwrap();
        let b = db
            .add_account("b@example.com", "b-login", &pw, "imap.qq.com:993")
            .await
            .unwrap();

        let active = db.list_active_accounts().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].username, "b-login");
        assert_eq!(active[1].server, "imap.qq.com:993");
        assert_eq!(active[0].password.expose_secret(), "secret");
        assert!(active[0].is_active);

        db.set_account_active(a, false).await.unwrap();
        let active = db.list_active_accounts().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b);
    }

    #[tokio::test]
    async fn toggling_unknown_account_fails() {
        let db = test_db().await;
        assert!(db.set_account_active(99, true).await.is_err());
    }

    #[tokio::test]
    async fn target_lookup_is_exact() {
        let db = test_db().await;
        db.add_target("张三", "zhangsan@example.com", Some("oncall"))
            .await
            .unwrap();
        db.add_target("Finance", "finance@example.com", None)
            .await
            .unwrap();

        let t = db.lookup_target("张三").await.unwrap().unwrap();
        assert_eq!(t.email, "zhangsan@example.com");
        assert_eq!(t.description.as_deref(), Some("oncall"));
        assert!(db.lookup_target("finance").await.unwrap().is_none());
        assert!(db.lookup_target("Finance").await.unwrap().unwrap().description.is_none());
    }

    #[tokio::test]
    async fn duplicate_target_names_rejected() {
        let db = test_db().await;
        db.add_target("ops", "a@example.com", None).await.unwrap();
        assert!(db.add_target("ops", "b@example.com", None).await.is_err());
    }

    #[tokio::test]
    async fn append_is_check_and_insert() {
        let db = test_db().await;
        let msg = message("1-42");
        let first = DispatchOutcome::forwarded(1, &msg, "zhangsan@example.com");
        let second = DispatchOutcome::failed(1, &msg, None, "later");

        assert!(db.append_outcome(&first).await.unwrap());
        assert!(!db.append_outcome(&second).await.unwrap());

        let stored = db.find_outcome(1, "1-42").await.unwrap().unwrap();
        assert_eq!(stored.status, OutcomeStatus::Forwarded);
        assert_eq!(stored.forward_to.as_deref(), Some("zhangsan@example.com"));
        assert!(stored.forwarded_at.is_some());
        assert_eq!(stored.subject, "报警 - 张三");
    }

    #[tokio::test]
    async fn outcomes_are_scoped_per_account() {
        let db = test_db().await;
        let msg = message("1-42");
        db.append_outcome(&DispatchOutcome::failed(1, &msg, None, "x"))
            .await
            .unwrap();
        assert!(db.find_outcome(2, "1-42").await.unwrap().is_none());
        assert!(
            db.append_outcome(&DispatchOutcome::failed(2, &msg, None, "x"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn list_returns_newest_first() {
        let db = test_db().await;
        for id in ["1-1", "1-2", "1-3"] {
            db.append_outcome(&DispatchOutcome::failed(1, &message(id), None, "e"))
                .await
                .unwrap();
        }
        let listed = db.list_outcomes(2).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|o| o.message_id.as_str()).collect();
        assert_eq!(ids, vec!["1-3", "1-2"]);
        assert_eq!(listed[0].error.as_deref(), Some("e"));
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let db = test_db().await;
        db.append_outcome(&DispatchOutcome::failed(1, &message("1-1"), None, "e"))
            .await
            .unwrap();
        db.conn
            .execute(
                "UPDATE mail_logs SET created_at = ?1 WHERE message_id = '1-1'",
                params![(Utc::now() - chrono::Duration::days(40)).to_rfc3339()],
            )
            .await
            .unwrap();
        db.append_outcome(&DispatchOutcome::failed(1, &message("1-2"), None, "e"))
            .await
            .unwrap();

        assert_eq!(db.prune_outcomes(30).await.unwrap(), 1);
        assert!(db.find_outcome(1, "1-1").await.unwrap().is_none());
        assert!(db.find_outcome(1, "1-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dispatch.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.add_target("ops", "ops@example.com", None).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.lookup_target("ops").await.unwrap().is_some());
    }
}
