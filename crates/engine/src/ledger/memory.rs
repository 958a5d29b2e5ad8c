//! In-memory ledger store for tests and dry runs

use crate::context::ExecutionContext;
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::{LedgerStore, LockCoordinator, SqlExecutor};
use crate::record::{MigrationRecord, MigrationStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Counters describing what the store has been asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLedgerStats {
    pub writes: usize,
    pub lock_acquired: usize,
    pub lock_released: usize,
    pub invalid_transitions: usize,
}

#[derive(Debug, Default)]
struct Faults {
    fail_connect: bool,
    fail_lock: bool,
    fail_release: bool,
    /// Remaining successful writes before every write fails
    writes_before_failure: Option<usize>,
}

/// In-memory ledger backed by a sorted map
///
/// Records live in a single critical section so upserts are atomic. The lock is a
/// one-permit semaphore, which gives the same blocking semantics as an advisory lock
/// across tasks sharing one store.
pub struct MemoryLedger {
    records: Mutex<BTreeMap<(i64, String), MigrationRecord>>,
    executed: Mutex<Vec<String>>,
    stats: Mutex<MemoryLedgerStats>,
    faults: Mutex<Faults>,
    lock: Semaphore,
    lock_held: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            executed: Mutex::new(Vec::new()),
            stats: Mutex::new(MemoryLedgerStats::default()),
            faults: Mutex::new(Faults::default()),
            lock: Semaphore::new(1),
            lock_held: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    /// Seed records directly, bypassing write accounting
    pub fn with_records(records: impl IntoIterator<Item = MigrationRecord>) -> Self {
        let ledger = Self::new();
        {
            let mut map = ledger.records.lock();
            for record in records {
                map.insert(record.key(), record);
            }
        }
        ledger
    }

    /// Make `connect` fail
    pub fn fail_connect(&self, fail: bool) {
        self.faults.lock().fail_connect = fail;
    }

    /// Make lock acquisition fail
    pub fn fail_lock(&self, fail: bool) {
        self.faults.lock().fail_lock = fail;
    }

    /// Make lock release fail
    pub fn fail_release(&self, fail: bool) {
        self.faults.lock().fail_release = fail;
    }

    /// Allow `n` more successful writes, then fail every write
    pub fn fail_writes_after(&self, n: usize) {
        self.faults.lock().writes_before_failure = Some(n);
    }

    /// Clear all injected faults
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn stats(&self) -> MemoryLedgerStats {
        self.stats.lock().clone()
    }

    /// SQL payloads executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Snapshot of all records in ascending version order
    pub fn records(&self) -> Vec<MigrationRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// Current record for a version, if any
    pub fn record(&self, version: i64) -> Option<MigrationRecord> {
        self.records
            .lock()
            .values()
            .find(|r| r.version == version)
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_held.load(Ordering::SeqCst)
    }

    /// How many times a session was actually opened
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> MigrateResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MigrateError::Connection("not connected".to_string()))
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SqlExecutor for MemoryLedger {
    async fn execute(&self, payload: &str, ctx: &ExecutionContext) -> MigrateResult<()> {
        self.ensure_connected()?;
        if payload.trim().is_empty() {
            return Ok(());
        }
        if ctx.is_cancelled() {
            return Err(MigrateError::Interrupted("statement cancelled".to_string()));
        }
        self.executed.lock().push(payload.to_string());
        Ok(())
    }
}

#[async_trait]
impl LockCoordinator for MemoryLedger {
    async fn acquire(&self, ctx: &ExecutionContext) -> MigrateResult<()> {
        self.ensure_connected()?;
        if self.faults.lock().fail_lock {
            return Err(MigrateError::Lock("lock unavailable".to_string()));
        }
        if ctx.is_cancelled() {
            return Err(MigrateError::Interrupted(
                "cancelled before acquiring the lock".to_string(),
            ));
        }

        let permit = tokio::select! {
            permit = self.lock.acquire() => {
                permit.map_err(|e| MigrateError::Lock(e.to_string()))?
            }
            _ = ctx.cancelled() => {
                return Err(MigrateError::Interrupted(
                    "cancelled while waiting for the lock".to_string(),
                ));
            }
        };
        // Held until `release` hands the permit back
        permit.forget();
        self.lock_held.store(true, Ordering::SeqCst);
        self.stats.lock().lock_acquired += 1;
        Ok(())
    }

    async fn release(&self, _ctx: &ExecutionContext) -> MigrateResult<()> {
        if self.faults.lock().fail_release {
            return Err(MigrateError::Lock("unlock failed".to_string()));
        }
        if !self.lock_held.swap(false, Ordering::SeqCst) {
            return Err(MigrateError::Lock("lock is not held".to_string()));
        }
        self.lock.add_permits(1);
        self.stats.lock().lock_released += 1;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn connect(&self) -> MigrateResult<()> {
        if self.faults.lock().fail_connect {
            return Err(MigrateError::Connection("connection refused".to_string()));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn close(&self) -> MigrateResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_or_update(&self, record: &MigrationRecord) -> MigrateResult<()> {
        self.ensure_connected()?;
        {
            let mut faults = self.faults.lock();
            if let Some(remaining) = faults.writes_before_failure.as_mut() {
                if *remaining == 0 {
                    return Err(MigrateError::Ledger("write rejected".to_string()));
                }
                *remaining -= 1;
            }
        }

        let mut records = self.records.lock();
        let previous = records.get(&record.key()).map(|r| r.status);
        let mut stats = self.stats.lock();
        if !MigrationStatus::can_transition(previous, record.status) {
            stats.invalid_transitions += 1;
        }
        stats.writes += 1;
        records.insert(record.key(), record.clone());
        Ok(())
    }

    async fn select_all(&self) -> MigrateResult<Vec<MigrationRecord>> {
        self.ensure_connected()?;
        let records: Vec<MigrationRecord> = self.records.lock().values().rev().cloned().collect();
        if records.is_empty() {
            return Err(MigrateError::NotFound("ledger is empty".to_string()));
        }
        Ok(records)
    }

    async fn select_last_by_status(
        &self,
        status: MigrationStatus,
    ) -> MigrateResult<MigrationRecord> {
        self.ensure_connected()?;
        self.records
            .lock()
            .values()
            .rev()
            .find(|r| r.status == status)
            .cloned()
            .ok_or_else(|| MigrateError::NotFound(format!("no migration with status {}", status)))
    }

    async fn delete_all(&self) -> MigrateResult<()> {
        self.ensure_connected()?;
        self.records.lock().clear();
        Ok(())
    }

    fn as_executor(&self) -> &dyn SqlExecutor {
        self
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::select_last_by_status_str;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();

        ledger
            .insert_or_update(&MigrationRecord::new(1, "create_users", MigrationStatus::InProgress))
            .await
            .unwrap();
        ledger
            .insert_or_update(&MigrationRecord::new(1, "create_users", MigrationStatus::Applied))
            .await
            .unwrap();

        let records = ledger.select_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, MigrationStatus::Applied);
        assert_eq!(ledger.stats().writes, 2);
        assert_eq!(ledger.stats().invalid_transitions, 0);
    }

    #[tokio::test]
    async fn test_select_all_orders_descending_and_reports_empty() {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();
        assert!(ledger.select_all().await.unwrap_err().is_not_found());

        for (version, name) in [(2, "b"), (1, "a"), (3, "c")] {
            ledger
                .insert_or_update(&MigrationRecord::new(version, name, MigrationStatus::InProgress))
                .await
                .unwrap();
        }
        let versions: Vec<i64> = ledger
            .select_all()
            .await
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_select_last_by_status() {
        let ledger = MemoryLedger::with_records([
            MigrationRecord::new(1, "a", MigrationStatus::Applied),
            MigrationRecord::new(2, "b", MigrationStatus::Applied),
            MigrationRecord::new(3, "c", MigrationStatus::Failed),
        ]);
        ledger.connect().await.unwrap();

        let last = ledger.select_last_by_status(MigrationStatus::Applied).await.unwrap();
        assert_eq!(last.version, 2);
        assert!(ledger
            .select_last_by_status(MigrationStatus::RolledBack)
            .await
            .unwrap_err()
            .is_not_found());

        let by_str = select_last_by_status_str(&ledger, "failed").await.unwrap();
        assert_eq!(by_str.version, 3);
        assert!(matches!(
            select_last_by_status_str(&ledger, "bogus").await,
            Err(MigrateError::InvalidStatus(_))
        ));
    }

    #[tokio::test]
    async fn test_calls_require_connection() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.select_all().await,
            Err(MigrateError::Connection(_))
        ));
        ledger.connect().await.unwrap();
        ledger.connect().await.unwrap();
        assert_eq!(ledger.connect_count(), 1);
        ledger.close().await.unwrap();
        ledger.close().await.unwrap();
        assert!(!ledger.is_connected());
    }

    #[tokio::test]
    async fn test_lock_blocks_second_holder() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.connect().await.unwrap();
        let ctx = ExecutionContext::new();

        ledger.acquire(&ctx).await.unwrap();
        assert!(ledger.is_locked());

        let contender = {
            let ledger = ledger.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { ledger.acquire(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        ledger.release(&ctx).await.unwrap();
        contender.await.unwrap().unwrap();
        ledger.release(&ctx).await.unwrap();
        assert_eq!(ledger.stats().lock_acquired, 2);
        assert_eq!(ledger.stats().lock_released, 2);
    }

    #[tokio::test]
    async fn test_acquire_honours_cancellation() {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();
        let holder = ExecutionContext::new();
        ledger.acquire(&holder).await.unwrap();

        let waiter = ExecutionContext::new();
        waiter.cancel();
        assert!(matches!(
            ledger.acquire(&waiter).await,
            Err(MigrateError::Interrupted(_))
        ));

        let waiter = ExecutionContext::new();
        let pending = {
            let waiter = waiter.clone();
            async move { ledger.acquire(&waiter).await }
        };
        let canceller = waiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        assert!(matches!(pending.await, Err(MigrateError::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_release_without_acquire_fails() {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();
        assert!(matches!(
            ledger.release(&ExecutionContext::new()).await,
            Err(MigrateError::Lock(_))
        ));
    }

    #[tokio::test]
    async fn test_write_fault_injection() {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();
        ledger.fail_writes_after(1);

        let record = MigrationRecord::new(1, "a", MigrationStatus::InProgress);
        ledger.insert_or_update(&record).await.unwrap();
        assert!(matches!(
            ledger.insert_or_update(&record).await,
            Err(MigrateError::Ledger(_))
        ));

        ledger.clear_faults();
        ledger.insert_or_update(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_records_payloads() {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();
        let ctx = ExecutionContext::new();
        ledger.execute("  ", &ctx).await.unwrap();
        ledger.execute("CREATE TABLE t (id INT)", &ctx).await.unwrap();
        assert_eq!(ledger.executed(), vec!["CREATE TABLE t (id INT)".to_string()]);

        ctx.cancel();
        assert!(matches!(
            ledger.execute("DROP TABLE t", &ctx).await,
            Err(MigrateError::Interrupted(_))
        ));
        assert_eq!(ledger.executed().len(), 1);
    }
}
