//! Migration source: definitions discovered from a directory

pub mod create;
pub mod loader;
pub mod script;

pub use create::{create_migration, last_version, CreatedMigration};
pub use loader::load_migrations;
pub use script::{ScriptError, ScriptProcedure};

use crate::definition::MigrationDefinition;
use crate::error::MigrateResult;
use migrator_core::{MigrationKind, MigratorConfig};
use std::path::{Path, PathBuf};

/// A migrations directory plus what scripts need to reach the database
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
    database_url: Option<String>,
}

impl MigrationSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            database_url: None,
        }
    }

    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            dir: config.migrations_dir.clone(),
            database_url: config.database_url.clone(),
        }
    }

    /// URL exported to script migrations as `DATABASE_URL`
    pub fn with_database_url(mut self, database_url: impl Into<String>) -> Self {
        self.database_url = Some(database_url.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every definition, ordered and contiguous from 1
    pub fn load(&self) -> MigrateResult<Vec<MigrationDefinition>> {
        load_migrations(&self.dir, self.database_url.as_deref())
    }

    /// Scaffold the next migration
    pub fn create(&self, name: &str, kind: MigrationKind) -> MigrateResult<CreatedMigration> {
        create_migration(&self.dir, name, kind)
    }
}
