//! Migration definitions and the actions they carry

use crate::context::ExecutionContext;
use crate::error::{ActionError, MigrateError};
use crate::ledger::SqlExecutor;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Which way a migration is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Suffix used in migration file names
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A migration step implemented in code rather than as a SQL payload
#[async_trait]
pub trait Procedure: Send + Sync {
    /// Run the step. The executor runs statements on the ledger's own connection.
    ///
    /// The future is dropped if `ctx` is cancelled first.
    async fn run(&self, executor: &dyn SqlExecutor, ctx: &ExecutionContext)
        -> Result<(), ActionError>;

    /// Short description used in logs
    fn describe(&self) -> String {
        "procedure".to_string()
    }
}

/// What runs when a migration is applied or rolled back
#[derive(Clone, Default)]
pub enum Action {
    /// Nothing to run; always succeeds
    #[default]
    Empty,
    /// A literal SQL payload, possibly several statements
    Sql(String),
    /// A callable procedure
    Procedure(Arc<dyn Procedure>),
}

impl Action {
    /// SQL action, collapsing blank payloads to `Empty`
    pub fn sql(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        if payload.trim().is_empty() {
            Action::Empty
        } else {
            Action::Sql(payload)
        }
    }

    pub fn procedure<P: Procedure + 'static>(procedure: P) -> Self {
        Action::Procedure(Arc::new(procedure))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Action::Empty)
    }

    pub async fn execute(
        &self,
        executor: &dyn SqlExecutor,
        ctx: &ExecutionContext,
    ) -> Result<(), ActionError> {
        match self {
            Action::Empty => Ok(()),
            Action::Sql(payload) => executor.execute(payload, ctx).await.map_err(Into::into),
            Action::Procedure(procedure) => tokio::select! {
                biased;
                _ = ctx.cancelled() => Err(MigrateError::Interrupted(format!(
                    "{} cancelled",
                    procedure.describe()
                ))
                .into()),
                result = procedure.run(executor, ctx) => result,
            },
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Empty => write!(f, "Empty"),
            Action::Sql(payload) => f.debug_tuple("Sql").field(payload).finish(),
            Action::Procedure(procedure) => write!(f, "Procedure({})", procedure.describe()),
        }
    }
}

/// One versioned migration, immutable once loaded
#[derive(Debug, Clone)]
pub struct MigrationDefinition {
    pub version: i64,
    pub name: String,
    pub up: Action,
    pub down: Action,
}

impl MigrationDefinition {
    pub fn new(version: i64, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            up: Action::Empty,
            down: Action::Empty,
        }
    }

    pub fn with_up(mut self, action: Action) -> Self {
        self.up = action;
        self
    }

    pub fn with_down(mut self, action: Action) -> Self {
        self.down = action;
        self
    }

    /// The action for the given direction
    pub fn action(&self, direction: Direction) -> &Action {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_sql_is_empty() {
        assert!(Action::sql("  \n\t").is_empty());
        assert!(matches!(Action::sql("SELECT 1"), Action::Sql(_)));
    }

    #[test]
    fn test_definition_builder() {
        let def = MigrationDefinition::new(1, "create_users")
            .with_up(Action::sql("CREATE TABLE users (id INT)"))
            .with_down(Action::sql("DROP TABLE users"));

        assert!(matches!(def.action(Direction::Up), Action::Sql(sql) if sql.starts_with("CREATE")));
        assert!(matches!(def.action(Direction::Down), Action::Sql(sql) if sql.starts_with("DROP")));
        assert_eq!(Direction::Down.to_string(), "down");
    }
}
