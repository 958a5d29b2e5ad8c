//! The migration engine
//!
//! Decides which versions to run from the ledger's last applied version and
//! drives each step through the two-write pattern: a transient status before the
//! action, the outcome after it.

use crate::context::ExecutionContext;
use crate::definition::{Direction, MigrationDefinition};
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::LedgerStore;
use crate::lock::with_lock;
use crate::record::{MigrationRecord, MigrationStatus};
use crate::report::{StatusReport, UpReport};
use std::sync::Arc;
use tracing::{Instrument, Span};

/// Applies and rolls back migrations against one ledger store
pub struct Migrator {
    store: Arc<dyn LedgerStore>,
    definitions: Vec<MigrationDefinition>,
    span: Span,
}

impl Migrator {
    /// Build an engine over `definitions`, which must be contiguous from version 1
    pub fn new(store: Arc<dyn LedgerStore>, mut definitions: Vec<MigrationDefinition>) -> Self {
        definitions.sort_by_key(|d| d.version);
        Self {
            store,
            definitions,
            span: tracing::info_span!("migrator"),
        }
    }

    /// Parent span for every operation's logs
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn definitions(&self) -> &[MigrationDefinition] {
        &self.definitions
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    fn known(&self) -> i64 {
        self.definitions.len() as i64
    }

    fn operation_span(&self, operation: &'static str) -> Span {
        tracing::info_span!(parent: &self.span, "operation", op = operation)
    }

    /// Open the store session and ensure the ledger exists
    pub async fn connect(&self) -> MigrateResult<()> {
        async {
            self.store.connect().await?;
            tracing::debug!(backend = self.store.backend_name(), "Connected to ledger");
            Ok(())
        }
        .instrument(self.operation_span("connect"))
        .await
    }

    /// Release the store session
    pub async fn close(&self) -> MigrateResult<()> {
        self.store
            .close()
            .instrument(self.operation_span("close"))
            .await
    }

    /// Apply every version after the last applied one, stopping at the first failure
    pub async fn up(&self, ctx: &ExecutionContext) -> MigrateResult<UpReport> {
        with_lock(&*self.store, ctx, self.up_locked(ctx))
            .instrument(self.operation_span("up"))
            .await
    }

    /// Roll back the most recently applied version
    pub async fn down(&self, ctx: &ExecutionContext) -> MigrateResult<MigrationRecord> {
        with_lock(&*self.store, ctx, self.down_locked(ctx))
            .instrument(self.operation_span("down"))
            .await
    }

    /// Roll back the most recently applied version and apply it again
    pub async fn redo(&self, ctx: &ExecutionContext) -> MigrateResult<i64> {
        let operation = async {
            let rolled_back = self.down_locked(ctx).await?;
            let definition = self.definition(rolled_back.version)?;
            stop_if_cancelled(ctx)?;
            self.apply_one(definition, ctx).await?;
            tracing::info!(version = rolled_back.version, "Migration redone");
            Ok(rolled_back.version)
        };

        with_lock(&*self.store, ctx, operation)
            .instrument(self.operation_span("redo"))
            .await
    }

    /// Every ledger record, highest version first
    pub async fn status(&self, ctx: &ExecutionContext) -> MigrateResult<StatusReport> {
        let operation = async {
            match self.store.select_all().await {
                Ok(records) => Ok(StatusReport::new(records)),
                Err(e) if e.is_not_found() => Ok(StatusReport::default()),
                Err(e) => Err(e),
            }
        };

        with_lock(&*self.store, ctx, operation)
            .instrument(self.operation_span("status"))
            .await
    }

    /// Version of the most recently applied migration, 0 when none
    pub async fn db_version(&self, ctx: &ExecutionContext) -> MigrateResult<i64> {
        let operation = async { Ok(self.last_applied().await?.map_or(0, |r| r.version)) };

        with_lock(&*self.store, ctx, operation)
            .instrument(self.operation_span("dbversion"))
            .await
    }

    async fn up_locked(&self, ctx: &ExecutionContext) -> MigrateResult<UpReport> {
        let last_applied = self.last_applied().await?.map_or(0, |r| r.version);
        self.ensure_consistent(last_applied)?;

        let mut report = UpReport::default();
        for definition in self.definitions.iter().filter(|d| d.version > last_applied) {
            stop_if_cancelled(ctx)?;
            self.apply_one(definition, ctx).await?;
            report.applied.push(definition.version);
        }

        if report.is_empty() {
            tracing::info!(version = last_applied, "Database is up to date");
        } else {
            tracing::info!(
                from = last_applied,
                to = report.last().unwrap_or(last_applied),
                count = report.applied.len(),
                "Migrations applied"
            );
        }
        Ok(report)
    }

    async fn down_locked(&self, ctx: &ExecutionContext) -> MigrateResult<MigrationRecord> {
        let last = self
            .store
            .select_last_by_status(MigrationStatus::Applied)
            .await?;
        self.ensure_consistent(last.version)?;

        let definition = self.definition(last.version)?;
        if definition.name != last.name {
            tracing::warn!(
                version = last.version,
                ledger_name = %last.name,
                name = %definition.name,
                "Ledger name differs from the migration definition"
            );
        }

        // The ledger row keeps its own key even if the definition was renamed
        self.write(last.version, &last.name, MigrationStatus::RollingBack)
            .await?;
        tracing::info!(version = last.version, name = %last.name, "Rolling back migration");

        match self.run_action(definition, Direction::Down, ctx).await {
            Ok(()) => {
                let record = self
                    .write(last.version, &last.name, MigrationStatus::RolledBack)
                    .await?;
                tracing::info!(version = last.version, name = %last.name, "Migration rolled back");
                Ok(record)
            }
            Err(err) => Err(self.record_failure(last.version, &last.name, err).await),
        }
    }

    async fn apply_one(
        &self,
        definition: &MigrationDefinition,
        ctx: &ExecutionContext,
    ) -> MigrateResult<()> {
        let (version, name) = (definition.version, definition.name.as_str());
        self.write(version, name, MigrationStatus::InProgress).await?;
        tracing::info!(version, name, "Applying migration");

        match self.run_action(definition, Direction::Up, ctx).await {
            Ok(()) => {
                self.write(version, name, MigrationStatus::Applied).await?;
                tracing::info!(version, name, "Migration applied");
                Ok(())
            }
            Err(err) => Err(self.record_failure(version, name, err).await),
        }
    }

    /// Run one direction's action. The action observes `ctx` and returns once the
    /// store has aborted whatever it was running.
    async fn run_action(
        &self,
        definition: &MigrationDefinition,
        direction: Direction,
        ctx: &ExecutionContext,
    ) -> MigrateResult<()> {
        let cancelled = || MigrateError::Cancelled {
            version: definition.version,
            name: definition.name.clone(),
        };
        if ctx.is_cancelled() {
            return Err(cancelled());
        }

        match definition
            .action(direction)
            .execute(self.store.as_executor(), ctx)
            .await
        {
            Ok(()) => Ok(()),
            Err(source) if ctx.is_cancelled() => {
                tracing::debug!(error = %source, "Action stopped by cancellation");
                Err(cancelled())
            }
            Err(source) => Err(MigrateError::ActionFailed {
                version: definition.version,
                name: definition.name.clone(),
                direction,
                source,
            }),
        }
    }

    /// Mark the version failed and hand back the error that caused it
    async fn record_failure(&self, version: i64, name: &str, err: MigrateError) -> MigrateError {
        tracing::error!(version, name, error = %err, "Migration failed");
        if let Err(write_err) = self.write(version, name, MigrationStatus::Failed).await {
            tracing::error!(version, error = %write_err, "Failed to record migration failure");
        }
        err
    }

    async fn write(
        &self,
        version: i64,
        name: &str,
        status: MigrationStatus,
    ) -> MigrateResult<MigrationRecord> {
        let record = MigrationRecord::new(version, name, status);
        self.store.insert_or_update(&record).await?;
        tracing::debug!(version = record.version, status = %status, "Ledger updated");
        Ok(record)
    }

    async fn last_applied(&self) -> MigrateResult<Option<MigrationRecord>> {
        match self
            .store
            .select_last_by_status(MigrationStatus::Applied)
            .await
        {
            Ok(record) => Ok(Some(record)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn ensure_consistent(&self, last_applied: i64) -> MigrateResult<()> {
        if last_applied > self.known() {
            tracing::error!(
                last_applied,
                known = self.known(),
                "Ledger is ahead of the known migrations"
            );
            return Err(MigrateError::InconsistentVersion {
                last_applied,
                known: self.known(),
            });
        }
        Ok(())
    }

    fn definition(&self, version: i64) -> MigrateResult<&MigrationDefinition> {
        usize::try_from(version - 1)
            .ok()
            .and_then(|index| self.definitions.get(index))
            .filter(|d| d.version == version)
            .ok_or_else(|| MigrateError::Source(format!("no migration definition for version {}", version)))
    }
}

fn stop_if_cancelled(ctx: &ExecutionContext) -> MigrateResult<()> {
    if ctx.is_cancelled() {
        return Err(MigrateError::Interrupted(
            "cancelled between migrations".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Action;
    use crate::ledger::MemoryLedger;

    fn definitions(count: i64) -> Vec<MigrationDefinition> {
        (1..=count)
            .map(|v| {
                MigrationDefinition::new(v, format!("m{}", v))
                    .with_up(Action::sql(format!("-- up {}", v)))
                    .with_down(Action::sql(format!("-- down {}", v)))
            })
            .collect()
    }

    async fn migrator(ledger: &Arc<MemoryLedger>, count: i64) -> Migrator {
        let migrator = Migrator::new(ledger.clone(), definitions(count));
        migrator.connect().await.unwrap();
        migrator
    }

    #[tokio::test]
    async fn test_definitions_are_sorted() {
        let mut defs = definitions(3);
        defs.reverse();
        let migrator = Migrator::new(Arc::new(MemoryLedger::new()), defs);
        let versions: Vec<i64> = migrator.definitions().iter().map(|d| d.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_definition_lookup() {
        let migrator = Migrator::new(Arc::new(MemoryLedger::new()), definitions(2));
        assert_eq!(migrator.definition(2).unwrap().name, "m2");
        assert!(matches!(migrator.definition(0), Err(MigrateError::Source(_))));
        assert!(matches!(migrator.definition(3), Err(MigrateError::Source(_))));
    }

    #[tokio::test]
    async fn test_up_then_db_version() {
        let ledger = Arc::new(MemoryLedger::new());
        let migrator = migrator(&ledger, 3).await;
        let ctx = ExecutionContext::new();

        let report = migrator.up(&ctx).await.unwrap();
        assert_eq!(report.applied, vec![1, 2, 3]);
        assert_eq!(migrator.db_version(&ctx).await.unwrap(), 3);
        assert_eq!(ledger.stats().invalid_transitions, 0);
        assert!(!ledger.is_locked());
    }

    #[tokio::test]
    async fn test_inconsistent_ledger_halts_before_any_write() {
        let ledger = Arc::new(MemoryLedger::with_records([MigrationRecord::new(
            5,
            "future",
            MigrationStatus::Applied,
        )]));
        let migrator = migrator(&ledger, 2).await;
        let ctx = ExecutionContext::new();

        match migrator.up(&ctx).await {
            Err(MigrateError::InconsistentVersion { last_applied, known }) => {
                assert_eq!(last_applied, 5);
                assert_eq!(known, 2);
            }
            other => panic!("Expected inconsistency, got {:?}", other),
        }
        assert!(matches!(
            migrator.down(&ctx).await,
            Err(MigrateError::InconsistentVersion { .. })
        ));
        assert_eq!(ledger.stats().writes, 0);
        assert!(ledger.executed().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_before_lock() {
        let ledger = Arc::new(MemoryLedger::new());
        let migrator = migrator(&ledger, 1).await;
        let ctx = ExecutionContext::new();
        ctx.cancel();

        assert!(matches!(
            migrator.up(&ctx).await,
            Err(MigrateError::Interrupted(_))
        ));
        assert_eq!(ledger.stats().writes, 0);
        assert_eq!(ledger.stats().lock_acquired, 0);
    }
}
