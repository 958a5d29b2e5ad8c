//! Ledger rows and the per-version status state machine

use crate::error::MigrateError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of one migration version in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationStatus {
    InProgress,
    Applied,
    Failed,
    RollingBack,
    RolledBack,
}

impl MigrationStatus {
    pub const ALL: [MigrationStatus; 5] = [
        MigrationStatus::InProgress,
        MigrationStatus::Applied,
        MigrationStatus::Failed,
        MigrationStatus::RollingBack,
        MigrationStatus::RolledBack,
    ];

    /// Value persisted in the `status` column
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::InProgress => "in_progress",
            MigrationStatus::Applied => "applied",
            MigrationStatus::Failed => "failed",
            MigrationStatus::RollingBack => "rolling_back",
            MigrationStatus::RolledBack => "rolled_back",
        }
    }

    /// A step is running under this status
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrationStatus::InProgress | MigrationStatus::RollingBack)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    /// `None` as the origin means the version has no record yet.
    pub fn can_transition(from: Option<MigrationStatus>, next: MigrationStatus) -> bool {
        use MigrationStatus::*;
        match (from, next) {
            (None | Some(Failed) | Some(RolledBack), InProgress) => true,
            (Some(InProgress), Applied | Failed) => true,
            (Some(Applied), RollingBack) => true,
            (Some(RollingBack), RolledBack | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" | "process" => Ok(MigrationStatus::InProgress),
            "applied" | "success" => Ok(MigrationStatus::Applied),
            "failed" | "error" => Ok(MigrationStatus::Failed),
            "rolling_back" | "cancellation" => Ok(MigrationStatus::RollingBack),
            "rolled_back" | "cancel" => Ok(MigrationStatus::RolledBack),
            other => Err(MigrateError::InvalidStatus(other.to_string())),
        }
    }
}

/// One ledger row, keyed by `(version, name)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub status: MigrationStatus,
    pub status_change_time: DateTime<Utc>,
}

impl MigrationRecord {
    pub fn new(version: i64, name: impl Into<String>, status: MigrationStatus) -> Self {
        Self {
            version,
            name: name.into(),
            status,
            status_change_time: Utc::now(),
        }
    }

    /// Upsert key
    pub fn key(&self) -> (i64, String) {
        (self.version, self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_column_value() {
        for status in MigrationStatus::ALL {
            assert_eq!(status.as_str().parse::<MigrationStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_legacy_spellings() {
        assert_eq!("success".parse::<MigrationStatus>().unwrap(), MigrationStatus::Applied);
        assert_eq!("process".parse::<MigrationStatus>().unwrap(), MigrationStatus::InProgress);
        assert_eq!("cancel".parse::<MigrationStatus>().unwrap(), MigrationStatus::RolledBack);
        assert_eq!(
            "cancellation".parse::<MigrationStatus>().unwrap(),
            MigrationStatus::RollingBack
        );
        assert_eq!("error".parse::<MigrationStatus>().unwrap(), MigrationStatus::Failed);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        match "pending".parse::<MigrationStatus>() {
            Err(MigrateError::InvalidStatus(value)) => assert_eq!(value, "pending"),
            other => panic!("Expected InvalidStatus, got {:?}", other),
        }
    }

    #[test]
    fn test_state_machine() {
        use MigrationStatus::*;
        assert!(MigrationStatus::can_transition(None, InProgress));
        assert!(MigrationStatus::can_transition(Some(InProgress), Applied));
        assert!(MigrationStatus::can_transition(Some(Failed), InProgress));
        assert!(MigrationStatus::can_transition(Some(Applied), RollingBack));
        assert!(MigrationStatus::can_transition(Some(RollingBack), Failed));

        assert!(!MigrationStatus::can_transition(None, Applied));
        assert!(!MigrationStatus::can_transition(Some(Applied), InProgress));
        assert!(!MigrationStatus::can_transition(Some(RolledBack), RollingBack));
        assert!(InProgress.is_transient());
        assert!(!Applied.is_transient());
    }
}
