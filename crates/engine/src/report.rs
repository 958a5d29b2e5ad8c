//! Results returned by engine operations

use crate::record::MigrationRecord;
use std::fmt;

const BORDER_TOP: &str = "._____________________._____________________._____________________.";
const BORDER_BOTTOM: &str = "|_____________________|_____________________|_____________________|";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of an `up` invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpReport {
    /// Versions applied by this invocation, ascending
    pub applied: Vec<i64>,
}

impl UpReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Highest version applied by this invocation
    pub fn last(&self) -> Option<i64> {
        self.applied.last().copied()
    }
}

/// Ledger contents, highest version first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub records: Vec<MigrationRecord>,
}

impl StatusReport {
    pub fn new(records: Vec<MigrationRecord>) -> Self {
        Self { records }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.records.is_empty() {
            return writeln!(f, "no migrations");
        }

        writeln!(f, "{}", BORDER_TOP)?;
        writeln!(f, "| {:<19} | {:<19} | {:<19} |", "Name", "Status", "Time")?;
        for record in &self.records {
            writeln!(
                f,
                "| {:<19} | {:<19} | {} |",
                record.name,
                record.status.as_str(),
                record.status_change_time.format(TIME_FORMAT)
            )?;
        }
        writeln!(f, "{}", BORDER_BOTTOM)
    }
}
