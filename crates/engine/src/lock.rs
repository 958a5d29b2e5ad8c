//! Scoped acquisition of the ledger lock

use crate::context::ExecutionContext;
use crate::error::{MigrateError, MigrateResult};
use crate::ledger::LockCoordinator;
use std::future::Future;

/// Run `operation` while holding the lock.
///
/// The lock is released on every exit path once acquired, and never released if
/// acquisition failed. Acquisition errors reach the caller unchanged. An operation
/// error takes precedence over a release error.
pub async fn with_lock<L, F, T>(lock: &L, ctx: &ExecutionContext, operation: F) -> MigrateResult<T>
where
    L: LockCoordinator + ?Sized,
    F: Future<Output = MigrateResult<T>>,
{
    lock.acquire(ctx).await?;
    tracing::debug!("Lock acquired");

    let result = operation.await;
    let released = lock.release(ctx).await;

    match (result, released) {
        (Ok(value), Ok(())) => {
            tracing::debug!("Lock released");
            Ok(value)
        }
        (Ok(_), Err(release_err)) => Err(match release_err {
            MigrateError::Lock(_) => release_err,
            other => MigrateError::Lock(other.to_string()),
        }),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            tracing::error!(error = %release_err, "Failed to release lock after a failed operation");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerStore, MemoryLedger};

    async fn connected() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.connect().await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_releases_after_success() {
        let ledger = connected().await;
        let ctx = ExecutionContext::new();

        let value = with_lock(&ledger, &ctx, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!ledger.is_locked());
        assert_eq!(ledger.stats().lock_released, 1);
    }

    #[tokio::test]
    async fn test_releases_after_failure() {
        let ledger = connected().await;
        let ctx = ExecutionContext::new();

        let result: MigrateResult<()> =
            with_lock(&ledger, &ctx, async { Err(MigrateError::Ledger("boom".into())) }).await;
        assert!(matches!(result, Err(MigrateError::Ledger(_))));
        assert!(!ledger.is_locked());
    }

    #[tokio::test]
    async fn test_no_release_when_acquire_fails() {
        let ledger = connected().await;
        ledger.fail_lock(true);
        let ctx = ExecutionContext::new();

        let mut ran = false;
        let result = with_lock(&ledger, &ctx, async {
            ran = true;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(MigrateError::Lock(_))));
        assert!(!ran);
        assert_eq!(ledger.stats().lock_released, 0);
    }

    #[tokio::test]
    async fn test_acquire_error_kind_is_kept() {
        let ledger = MemoryLedger::new();
        let ctx = ExecutionContext::new();
        let result = with_lock(&ledger, &ctx, async { Ok(()) }).await;
        assert!(matches!(result, Err(MigrateError::Connection(_))));

        ledger.connect().await.unwrap();
        ctx.cancel();
        let result = with_lock(&ledger, &ctx, async { Ok(()) }).await;
        assert!(matches!(result, Err(MigrateError::Interrupted(_))));
        assert_eq!(ledger.stats().lock_released, 0);
    }

    #[tokio::test]
    async fn test_release_failure_after_success_is_reported() {
        let ledger = connected().await;
        ledger.fail_release(true);
        let ctx = ExecutionContext::new();

        let result = with_lock(&ledger, &ctx, async { Ok(()) }).await;
        assert!(matches!(result, Err(MigrateError::Lock(_))));
    }

    #[tokio::test]
    async fn test_operation_error_wins_over_release_error() {
        let ledger = connected().await;
        ledger.fail_release(true);
        let ctx = ExecutionContext::new();

        let result: MigrateResult<()> =
            with_lock(&ledger, &ctx, async { Err(MigrateError::NotFound("none".into())) }).await;
        assert!(result.unwrap_err().is_not_found());
    }
}
