//! # migrator-engine
//!
//! Versioned schema migrations with a durable ledger.
//!
//! The [`Migrator`] applies an ordered, contiguous list of [`MigrationDefinition`]s
//! against a [`LedgerStore`], recording every attempt so that re-running is safe and
//! the exact history can be inspected. One operation runs at a time under the
//! store's exclusive lock.
//!
//! ## Quick Start
//!
//! ```rust
//! use migrator_engine::{Action, ExecutionContext, MemoryLedger, MigrationDefinition, Migrator};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let definitions = vec![
//!     MigrationDefinition::new(1, "create_users")
//!         .with_up(Action::sql("CREATE TABLE users (id BIGINT PRIMARY KEY)"))
//!         .with_down(Action::sql("DROP TABLE users")),
//! ];
//!
//! let migrator = Migrator::new(Arc::new(MemoryLedger::new()), definitions);
//! let ctx = ExecutionContext::new();
//!
//! migrator.connect().await.unwrap();
//! migrator.up(&ctx).await.unwrap();
//! assert_eq!(migrator.db_version(&ctx).await.unwrap(), 1);
//! migrator.close().await.unwrap();
//! # });
//! ```

pub mod context;
pub mod definition;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod record;
pub mod report;
pub mod source;

pub use context::ExecutionContext;
pub use definition::{Action, Direction, MigrationDefinition, Procedure};
pub use engine::Migrator;
pub use error::{ActionError, MigrateError, MigrateResult};
pub use ledger::{LedgerStore, LockCoordinator, MemoryLedger, PostgresLedger, SqlExecutor};
pub use record::{MigrationRecord, MigrationStatus};
pub use report::{StatusReport, UpReport};
pub use source::{
    create_migration, load_migrations, CreatedMigration, MigrationSource, ScriptProcedure,
};
