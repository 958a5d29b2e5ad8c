//! PostgreSQL ledger store
//!
//! Uses one persistent session: advisory locks belong to the session that took
//! them, so lock, ledger writes, migration payloads and unlock all go through the
//! same connection.
//!
//! Cancelling a running payload sends `pg_cancel_backend` for the session's backend
//! from a short-lived side connection and waits for the server to abort the
//! statement, so the ledger write that follows never races the payload.

use crate::context::ExecutionContext;
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::{LedgerStore, LockCoordinator, SqlExecutor};
use crate::record::{MigrationRecord, MigrationStatus};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use migrator_core::config::validation::{redact, ConfigValidator, IdentifierValidator};
use migrator_core::MigratorConfig;
use sqlx::postgres::PgRow;
use sqlx::{Connection, Executor, PgConnection, Row};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Ledger stored in a PostgreSQL table, locked with `pg_advisory_lock`
pub struct PostgresLedger {
    database_url: String,
    table: String,
    lock_id: i64,
    conn: Mutex<Option<PgConnection>>,
    backend_pid: AtomicI32,
    /// Set while a payload runs; still set if its future was dropped mid-flight
    statement_running: AtomicBool,
}

impl PostgresLedger {
    /// Create a store; no connection is opened until `connect`
    pub fn new(
        database_url: impl Into<String>,
        table: impl Into<String>,
        lock_id: i64,
    ) -> MigrateResult<Self> {
        let table = table.into();
        IdentifierValidator { field: "table_name" }
            .validate(table.as_str())
            .map_err(|e| MigrateError::Ledger(e.to_string()))?;

        Ok(Self {
            database_url: database_url.into(),
            table,
            lock_id,
            conn: Mutex::new(None),
            backend_pid: AtomicI32::new(0),
            statement_running: AtomicBool::new(false),
        })
    }

    /// Create a store from resolved configuration
    pub fn from_config(config: &MigratorConfig) -> MigrateResult<Self> {
        let url = config
            .require_database_url()
            .map_err(|e| MigrateError::Connection(e.to_string()))?;
        Self::new(url, config.table_name.clone(), config.lock_id)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// Server process id of the open session
    pub fn backend_pid(&self) -> Option<i32> {
        match self.backend_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Lock the session, first cancelling any payload whose future was dropped
    /// while the server was still running it
    async fn session(&self) -> MutexGuard<'_, Option<PgConnection>> {
        let guard = self.conn.lock().await;
        if guard.is_some() && self.statement_running.swap(false, Ordering::SeqCst) {
            tracing::warn!(
                pid = self.backend_pid.load(Ordering::SeqCst),
                "Cancelling an abandoned statement"
            );
            if let Err(e) = self.cancel_backend().await {
                tracing::error!(error = %e, "Failed to cancel abandoned statement");
            }
        }
        guard
    }

    /// Ask the server to abort the statement running on our session
    async fn cancel_backend(&self) -> MigrateResult<()> {
        let pid = self.backend_pid.load(Ordering::SeqCst);
        let mut side = PgConnection::connect(&self.database_url)
            .await
            .map_err(|e| {
                MigrateError::Connection(format!(
                    "failed to open cancel connection to {}: {}",
                    redact(&self.database_url),
                    e
                ))
            })?;

        let signalled: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .fetch_one(&mut side)
                .await;
        let _ = side.close().await;

        if signalled? {
            Ok(())
        } else {
            Err(MigrateError::Ledger(format!(
                "backend {} could not be signalled",
                pid
            )))
        }
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             version INTEGER NOT NULL, \
             name VARCHAR(255) NOT NULL, \
             status VARCHAR(20) NOT NULL, \
             status_change_time TIMESTAMP NOT NULL, \
             PRIMARY KEY (version, name))",
            self.table
        )
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (version, name, status, status_change_time) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (version, name) DO UPDATE \
             SET status = EXCLUDED.status, status_change_time = EXCLUDED.status_change_time",
            self.table
        )
    }

    fn select_all_sql(&self) -> String {
        format!(
            "SELECT version, name, status, status_change_time FROM {} ORDER BY version DESC",
            self.table
        )
    }

    fn select_last_by_status_sql(&self) -> String {
        format!(
            "SELECT version, name, status, status_change_time FROM {} \
             WHERE status = $1 ORDER BY version DESC LIMIT 1",
            self.table
        )
    }
}

fn not_connected() -> MigrateError {
    MigrateError::Connection("not connected".to_string())
}

fn record_from_row(row: &PgRow) -> MigrateResult<MigrationRecord> {
    let version: i32 = row.try_get("version")?;
    let name: String = row.try_get("name")?;
    let status: String = row.try_get("status")?;
    let changed: NaiveDateTime = row.try_get("status_change_time")?;

    Ok(MigrationRecord {
        version: i64::from(version),
        name,
        status: status.parse()?,
        status_change_time: changed.and_utc(),
    })
}

#[async_trait]
impl SqlExecutor for PostgresLedger {
    async fn execute(&self, payload: &str, ctx: &ExecutionContext) -> MigrateResult<()> {
        if payload.trim().is_empty() {
            return Ok(());
        }
        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;
        if ctx.is_cancelled() {
            return Err(MigrateError::Interrupted(
                "statement cancelled before it started".to_string(),
            ));
        }

        self.statement_running.store(true, Ordering::SeqCst);
        // A bare &str goes through the simple query protocol, which accepts
        // several statements in one payload.
        let mut query = Box::pin((&mut *conn).execute(payload));
        tokio::select! {
            biased;
            result = &mut query => {
                self.statement_running.store(false, Ordering::SeqCst);
                result?;
                return Ok(());
            }
            _ = ctx.cancelled() => {}
        }

        tracing::warn!(
            pid = self.backend_pid.load(Ordering::SeqCst),
            "Cancelling running statement"
        );
        if let Err(e) = self.cancel_backend().await {
            // The statement keeps running on the server; give up the session
            drop(query);
            self.statement_running.store(false, Ordering::SeqCst);
            self.backend_pid.store(0, Ordering::SeqCst);
            guard.take();
            return Err(MigrateError::Interrupted(format!(
                "statement cancelled, session dropped: {}",
                e
            )));
        }

        // Wait for the server to answer the aborted statement
        let drained = query.await;
        self.statement_running.store(false, Ordering::SeqCst);
        match drained {
            Ok(_) => {
                tracing::warn!("Statement completed before the cancel request took effect");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "Statement aborted");
                Err(MigrateError::Interrupted(
                    "statement cancelled on the server".to_string(),
                ))
            }
        }
    }
}

#[async_trait]
impl LockCoordinator for PostgresLedger {
    async fn acquire(&self, ctx: &ExecutionContext) -> MigrateResult<()> {
        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;
        if ctx.is_cancelled() {
            return Err(MigrateError::Interrupted(format!(
                "cancelled before acquiring advisory lock {}",
                self.lock_id
            )));
        }

        tracing::debug!(lock_id = self.lock_id, "Waiting for advisory lock");
        let outcome = tokio::select! {
            result = sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(self.lock_id)
                .execute(&mut *conn) => Some(result),
            _ = ctx.cancelled() => None,
        };

        match outcome {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(MigrateError::Lock(format!(
                "failed to acquire advisory lock {}: {}",
                self.lock_id, e
            ))),
            None => {
                // The aborted query leaves the session in an unknown state
                if let Some(conn) = guard.take() {
                    self.backend_pid.store(0, Ordering::SeqCst);
                    let _ = conn.close().await;
                }
                Err(MigrateError::Interrupted(format!(
                    "cancelled while waiting for advisory lock {}",
                    self.lock_id
                )))
            }
        }
    }

    async fn release(&self, _ctx: &ExecutionContext) -> MigrateResult<()> {
        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;

        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.lock_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                MigrateError::Lock(format!(
                    "failed to release advisory lock {}: {}",
                    self.lock_id, e
                ))
            })?;

        if released {
            Ok(())
        } else {
            Err(MigrateError::Lock(format!(
                "advisory lock {} was not held by this session",
                self.lock_id
            )))
        }
    }
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    async fn connect(&self) -> MigrateResult<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut conn = PgConnection::connect(&self.database_url)
            .await
            .map_err(|e| {
                MigrateError::Connection(format!(
                    "failed to connect to {}: {}",
                    redact(&self.database_url),
                    e
                ))
            })?;

        let setup: Result<i32, sqlx::Error> = async {
            (&mut conn).execute(self.create_table_sql().as_str()).await?;
            sqlx::query_scalar("SELECT pg_backend_pid()")
                .fetch_one(&mut conn)
                .await
        }
        .await;
        let pid = match setup {
            Ok(pid) => pid,
            Err(e) => {
                let _ = conn.close().await;
                return Err(MigrateError::Connection(format!(
                    "failed to prepare ledger table {}: {}",
                    self.table, e
                )));
            }
        };

        tracing::debug!(table = %self.table, pid, "Ledger connection established");
        self.backend_pid.store(pid, Ordering::SeqCst);
        self.statement_running.store(false, Ordering::SeqCst);
        *guard = Some(conn);
        Ok(())
    }

    async fn close(&self) -> MigrateResult<()> {
        let mut guard = self.session().await;
        if let Some(conn) = guard.take() {
            self.backend_pid.store(0, Ordering::SeqCst);
            conn.close().await?;
            tracing::debug!(table = %self.table, "Ledger connection closed");
        }
        Ok(())
    }

    async fn insert_or_update(&self, record: &MigrationRecord) -> MigrateResult<()> {
        let version = i32::try_from(record.version).map_err(|_| {
            MigrateError::Ledger(format!("version {} does not fit the ledger", record.version))
        })?;

        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;

        sqlx::query(&self.upsert_sql())
            .bind(version)
            .bind(&record.name)
            .bind(record.status.as_str())
            .bind(record.status_change_time.naive_utc())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                MigrateError::Ledger(format!(
                    "failed to record migration {} as {}: {}",
                    record.version, record.status, e
                ))
            })?;
        Ok(())
    }

    async fn select_all(&self) -> MigrateResult<Vec<MigrationRecord>> {
        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;

        let rows = sqlx::query(&self.select_all_sql())
            .fetch_all(&mut *conn)
            .await?;
        if rows.is_empty() {
            return Err(MigrateError::NotFound(format!("no records in {}", self.table)));
        }
        rows.iter().map(record_from_row).collect()
    }

    async fn select_last_by_status(
        &self,
        status: MigrationStatus,
    ) -> MigrateResult<MigrationRecord> {
        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;

        let row = sqlx::query(&self.select_last_by_status_sql())
            .bind(status.as_str())
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => record_from_row(&row),
            None => Err(MigrateError::NotFound(format!(
                "no migration with status {}",
                status
            ))),
        }
    }

    async fn delete_all(&self) -> MigrateResult<()> {
        let mut guard = self.session().await;
        let conn = guard.as_mut().ok_or_else(not_connected)?;
        (&mut *conn)
            .execute(format!("TRUNCATE {}", self.table).as_str())
            .await?;
        Ok(())
    }

    fn as_executor(&self) -> &dyn SqlExecutor {
        self
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unsafe_table_name() {
        let result = PostgresLedger::new("postgres://localhost/app", "ledger; DROP TABLE x", 1);
        assert!(matches!(result, Err(MigrateError::Ledger(_))));
    }

    #[test]
    fn test_generated_sql_uses_table() {
        let ledger = PostgresLedger::new("postgres://localhost/app", "ledger", 7).unwrap();
        assert!(ledger.create_table_sql().contains("CREATE TABLE IF NOT EXISTS ledger"));
        assert!(ledger.create_table_sql().contains("PRIMARY KEY (version, name)"));
        assert!(ledger.upsert_sql().contains("ON CONFLICT (version, name) DO UPDATE"));
        assert!(ledger.select_last_by_status_sql().ends_with("LIMIT 1"));
        assert_eq!(ledger.lock_id(), 7);
    }

    #[test]
    fn test_from_config_requires_database_url() {
        let config = MigratorConfig::new();
        assert!(matches!(
            PostgresLedger::from_config(&config),
            Err(MigrateError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_calls_before_connect_fail() {
        let ledger = PostgresLedger::new("postgres://localhost/app", "ledger", 1).unwrap();
        assert!(matches!(
            ledger.select_all().await,
            Err(MigrateError::Connection(_))
        ));
        assert!(matches!(
            ledger.acquire(&ExecutionContext::new()).await,
            Err(MigrateError::Connection(_))
        ));
        // Closing a store that never connected is fine
        ledger.close().await.unwrap();
        // Blank payloads never touch the session
        ledger.execute("   ", &ExecutionContext::new()).await.unwrap();
        assert!(matches!(
            ledger.execute("SELECT 1", &ExecutionContext::new()).await,
            Err(MigrateError::Connection(_))
        ));
        assert_eq!(ledger.backend_pid(), None);
    }
}
