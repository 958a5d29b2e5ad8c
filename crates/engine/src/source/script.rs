//! Shell script migration steps

use crate::context::ExecutionContext;
use crate::definition::Procedure;
use crate::error::ActionError;
use crate::ledger::SqlExecutor;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use thiserror::Error;
use tokio::process::Command;

/// Errors raised while running a migration script
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to start '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}' exited with {status}: {stderr}")]
    Failed {
        path: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("'{path}' was killed after cancellation")]
    Cancelled { path: String },
}

/// Runs `sh <file>` with the migration's coordinates in the environment
///
/// The script sees `DATABASE_URL` (when known), `MIGRATION_VERSION` and
/// `MIGRATION_NAME`. It runs in its own process and talks to the database
/// through its own client, so the SQL executor is not used.
#[derive(Debug, Clone)]
pub struct ScriptProcedure {
    path: PathBuf,
    version: i64,
    name: String,
    database_url: Option<String>,
}

impl ScriptProcedure {
    pub fn new(path: impl Into<PathBuf>, version: i64, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version,
            name: name.into(),
            database_url: None,
        }
    }

    pub fn with_database_url(mut self, database_url: Option<String>) -> Self {
        self.database_url = database_url;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn command(&self) -> Command {
        let mut command = Command::new("sh");
        command
            .arg(&self.path)
            .env("MIGRATION_VERSION", self.version.to_string())
            .env("MIGRATION_NAME", &self.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(url) = &self.database_url {
            command.env("DATABASE_URL", url);
        }
        command
    }
}

#[async_trait]
impl Procedure for ScriptProcedure {
    async fn run(
        &self,
        _executor: &dyn SqlExecutor,
        ctx: &ExecutionContext,
    ) -> Result<(), ActionError> {
        let path = self.path.display().to_string();
        let child = self.command().spawn().map_err(|source| ScriptError::Spawn {
            path: path.clone(),
            source,
        })?;

        // Dropping the wait future drops the child, which kills it
        let output = tokio::select! {
            output = child.wait_with_output() => output.map_err(|source| ScriptError::Spawn {
                path: path.clone(),
                source,
            })?,
            _ = ctx.cancelled() => return Err(ScriptError::Cancelled { path: path.clone() }.into()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            tracing::debug!(script = %path, "{}", line);
        }

        if output.status.success() {
            Ok(())
        } else {
            Err(ScriptError::Failed {
                path,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into())
        }
    }

    fn describe(&self) -> String {
        format!("sh {}", self.path.display())
    }
}
