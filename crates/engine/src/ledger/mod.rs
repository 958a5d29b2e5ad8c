//! Ledger store contract and its implementations

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use crate::context::ExecutionContext;
use crate::error::MigrateResult;
use crate::record::{MigrationRecord, MigrationStatus};
use async_trait::async_trait;

/// Runs literal SQL payloads on the store's session
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a payload that may hold several statements. Blank payloads are a no-op.
    ///
    /// When `ctx` is cancelled the running statement is aborted and the session is
    /// usable again before this returns `MigrateError::Interrupted`.
    async fn execute(&self, payload: &str, ctx: &ExecutionContext) -> MigrateResult<()>;
}

/// Cross-process exclusive lock
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Block until the lock is held or `ctx` is cancelled
    async fn acquire(&self, ctx: &ExecutionContext) -> MigrateResult<()>;

    /// Release a lock taken by `acquire` on the same session
    async fn release(&self, ctx: &ExecutionContext) -> MigrateResult<()>;
}

/// Durable record of every migration attempt
#[async_trait]
pub trait LedgerStore: SqlExecutor + LockCoordinator {
    /// Open the session and make sure the ledger table exists. Idempotent.
    async fn connect(&self) -> MigrateResult<()>;

    /// Close the session. Idempotent.
    async fn close(&self) -> MigrateResult<()>;

    /// Atomic upsert keyed by `(version, name)`
    async fn insert_or_update(&self, record: &MigrationRecord) -> MigrateResult<()>;

    /// Every record, highest version first. `NotFound` when the ledger is empty.
    async fn select_all(&self) -> MigrateResult<Vec<MigrationRecord>>;

    /// Highest-version record with `status`. `NotFound` when there is none.
    async fn select_last_by_status(&self, status: MigrationStatus)
        -> MigrateResult<MigrationRecord>;

    /// Remove every record
    async fn delete_all(&self) -> MigrateResult<()>;

    /// The store as a plain executor, handed to migration actions
    fn as_executor(&self) -> &dyn SqlExecutor;

    /// Store name for logs
    fn backend_name(&self) -> &'static str;
}

/// Look up by the persisted status string, rejecting unknown values
pub async fn select_last_by_status_str(
    store: &dyn LedgerStore,
    status: &str,
) -> MigrateResult<MigrationRecord> {
    let status: MigrationStatus = status.parse()?;
    store.select_last_by_status(status).await
}
