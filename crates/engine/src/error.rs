//! Error types for the migration engine

use crate::definition::Direction;
use thiserror::Error;

/// Boxed error returned by migration actions
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors raised by the engine, the ledger stores and the migration source
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error(
        "Inconsistent ledger: last applied version {last_applied} exceeds the {known} known migrations"
    )]
    InconsistentVersion { last_applied: i64, known: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Migration {version} ({name}) failed during {direction}: {source}")]
    ActionFailed {
        version: i64,
        name: String,
        direction: Direction,
        #[source]
        source: ActionError,
    },

    #[error("Migration {version} ({name}) was cancelled")]
    Cancelled { version: i64, name: String },

    /// Cancelled outside any single migration step, e.g. while waiting for the lock
    #[error("Cancelled: {0}")]
    Interrupted(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Invalid migration status '{0}'")]
    InvalidStatus(String),

    #[error("Migration source error: {0}")]
    Source(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// True when no matching ledger record exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, MigrateError::NotFound(_))
    }

    /// True when the error comes from a cancelled context
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            MigrateError::Cancelled { .. } | MigrateError::Interrupted(_)
        )
    }

    /// True for errors that stop the invocation before any migration action ran
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MigrateError::Connection(_)
                | MigrateError::Lock(_)
                | MigrateError::InconsistentVersion { .. }
        )
    }

    /// The migration version this error is about, if any
    pub fn version(&self) -> Option<i64> {
        match self {
            MigrateError::ActionFailed { version, .. } | MigrateError::Cancelled { version, .. } => {
                Some(*version)
            }
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MigrateError::NotFound("no matching ledger record".into()),
            other => MigrateError::Ledger(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(MigrateError::NotFound("x".into()).is_not_found());
        assert!(MigrateError::Lock("busy".into()).is_fatal());
        assert!(MigrateError::InconsistentVersion {
            last_applied: 5,
            known: 3
        }
        .is_fatal());
        assert!(!MigrateError::Ledger("write".into()).is_fatal());
    }

    #[test]
    fn test_cancellation_kinds() {
        let step = MigrateError::Cancelled {
            version: 3,
            name: "add_index".into(),
        };
        let waiting = MigrateError::Interrupted("cancelled while waiting for the lock".into());
        assert!(step.is_cancelled());
        assert!(waiting.is_cancelled());
        assert_eq!(waiting.version(), None);
        assert!(!MigrateError::Lock("busy".into()).is_cancelled());
    }

    #[test]
    fn test_action_failed_message_names_the_migration() {
        let err = MigrateError::ActionFailed {
            version: 2,
            name: "add_email".to_string(),
            direction: Direction::Up,
            source: "syntax error".into(),
        };
        let message = err.to_string();
        assert!(message.contains("Migration 2 (add_email)"));
        assert!(message.contains("up"));
        assert!(message.contains("syntax error"));
        assert_eq!(err.version(), Some(2));
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: MigrateError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }
}
