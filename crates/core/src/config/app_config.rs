use crate::config::validation::{
    ConfigValidator, DatabaseUrlValidator, IdentifierValidator, LogLevelValidator,
};
use crate::config::{ConfigError, ConfigSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default ledger table name
pub const DEFAULT_TABLE_NAME: &str = "schema_migrations";

/// Default advisory lock key shared by every migrator process
pub const DEFAULT_LOCK_ID: i64 = 123456;

/// Default migrations directory
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Configuration trait for layered tool configuration
pub trait AppConfigTrait: Sized {
    /// Load configuration from defaults and environment variables
    fn from_env() -> Result<Self, ConfigError>;

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError>;

    /// Get configuration source information for debugging
    fn config_sources(&self) -> HashMap<String, ConfigSource>;
}

/// How new migrations are scaffolded by `create`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationKind {
    /// Literal SQL files (`_up.sql` / `_down.sql`)
    #[default]
    Sql,
    /// Shell script procedures (`_up.sh` / `_down.sh`)
    Script,
}

impl MigrationKind {
    /// File extension used for this kind of migration
    pub fn extension(&self) -> &'static str {
        match self {
            MigrationKind::Sql => "sql",
            MigrationKind::Script => "sh",
        }
    }
}

impl FromStr for MigrationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sql" => Ok(MigrationKind::Sql),
            "script" | "sh" => Ok(MigrationKind::Script),
            _ => Err(ConfigError::invalid_value("migration_kind", s, "sql or script")),
        }
    }
}

impl fmt::Display for MigrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationKind::Sql => write!(f, "sql"),
            MigrationKind::Script => write!(f, "script"),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::invalid_value(
                "logging.format",
                s,
                "pretty, plain or json",
            )),
        }
    }
}

/// Logging section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Resolved migrator configuration
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    pub database_url: Option<String>,
    pub migrations_dir: PathBuf,
    pub table_name: String,
    pub lock_id: i64,
    pub migration_kind: MigrationKind,
    pub logging: LogSettings,
    sources: HashMap<String, ConfigSource>,
}

/// Shape of the YAML configuration file; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_url: Option<String>,
    migrations_dir: Option<PathBuf>,
    table_name: Option<String>,
    lock_id: Option<i64>,
    migration_kind: Option<MigrationKind>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<LogFormat>,
}

/// Values given on the command line; they win over every other source
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub migrations_dir: Option<PathBuf>,
    pub table_name: Option<String>,
    pub log_level: Option<String>,
}

impl MigratorConfig {
    /// Create a configuration holding only built-in defaults
    pub fn new() -> Self {
        let mut sources = HashMap::new();
        sources.insert("database_url".to_string(), ConfigSource::Default("unset".to_string()));
        sources.insert(
            "migrations_dir".to_string(),
            ConfigSource::Default(DEFAULT_MIGRATIONS_DIR.to_string()),
        );
        sources.insert(
            "table_name".to_string(),
            ConfigSource::Default(DEFAULT_TABLE_NAME.to_string()),
        );
        sources.insert(
            "lock_id".to_string(),
            ConfigSource::Default(DEFAULT_LOCK_ID.to_string()),
        );
        sources.insert(
            "migration_kind".to_string(),
            ConfigSource::Default(MigrationKind::Sql.to_string()),
        );
        sources.insert("logging.level".to_string(), ConfigSource::Default("info".to_string()));
        sources.insert(
            "logging.format".to_string(),
            ConfigSource::Default("pretty".to_string()),
        );

        Self {
            database_url: None,
            migrations_dir: PathBuf::from(DEFAULT_MIGRATIONS_DIR),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            lock_id: DEFAULT_LOCK_ID,
            migration_kind: MigrationKind::Sql,
            logging: LogSettings::default(),
            sources,
        }
    }

    /// Resolve the full layering: defaults, optional file, environment, command line
    pub fn load(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        if let Some(path) = path {
            config.merge_file(path)?;
        }
        config.merge_env()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Merge values from a YAML file on top of the current values
    pub fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: display.clone(),
            source,
        })?;
        self.merge_yaml(&content, &display)
    }

    /// Merge values from YAML text; `origin` is recorded as the file source
    pub fn merge_yaml(&mut self, content: &str, origin: &str) -> Result<(), ConfigError> {
        let file: FileConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::FileParse {
                path: origin.to_string(),
                source,
            })?;
        let from_file = || ConfigSource::File(origin.to_string());

        if let Some(url) = file.database_url {
            self.database_url = Some(url);
            self.sources.insert("database_url".to_string(), from_file());
        }
        if let Some(dir) = file.migrations_dir {
            self.migrations_dir = dir;
            self.sources.insert("migrations_dir".to_string(), from_file());
        }
        if let Some(table) = file.table_name {
            self.table_name = table;
            self.sources.insert("table_name".to_string(), from_file());
        }
        if let Some(lock_id) = file.lock_id {
            self.lock_id = lock_id;
            self.sources.insert("lock_id".to_string(), from_file());
        }
        if let Some(kind) = file.migration_kind {
            self.migration_kind = kind;
            self.sources.insert("migration_kind".to_string(), from_file());
        }
        if let Some(logging) = file.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
                self.sources.insert("logging.level".to_string(), from_file());
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
                self.sources.insert("logging.format".to_string(), from_file());
            }
        }

        Ok(())
    }

    /// Merge values from `MIGRATOR_*` environment variables
    pub fn merge_env(&mut self) -> Result<(), ConfigError> {
        for var in ["MIGRATOR_DATABASE_URL", "DATABASE_URL"] {
            if let Ok(url) = env::var(var) {
                self.database_url = Some(url);
                self.sources
                    .insert("database_url".to_string(), ConfigSource::EnvVar(var.to_string()));
                break;
            }
        }

        if let Ok(dir) = env::var("MIGRATOR_DIR") {
            self.migrations_dir = PathBuf::from(dir);
            self.sources.insert(
                "migrations_dir".to_string(),
                ConfigSource::EnvVar("MIGRATOR_DIR".to_string()),
            );
        }

        if let Ok(table) = env::var("MIGRATOR_TABLE") {
            self.table_name = table;
            self.sources.insert(
                "table_name".to_string(),
                ConfigSource::EnvVar("MIGRATOR_TABLE".to_string()),
            );
        }

        if let Ok(lock_str) = env::var("MIGRATOR_LOCK_ID") {
            self.lock_id = lock_str.parse().map_err(|_| {
                ConfigError::invalid_value("lock_id", lock_str.clone(), "a 64-bit integer")
            })?;
            self.sources.insert(
                "lock_id".to_string(),
                ConfigSource::EnvVar("MIGRATOR_LOCK_ID".to_string()),
            );
        }

        if let Ok(kind) = env::var("MIGRATOR_KIND") {
            self.migration_kind = kind.parse()?;
            self.sources.insert(
                "migration_kind".to_string(),
                ConfigSource::EnvVar("MIGRATOR_KIND".to_string()),
            );
        }

        if let Ok(level) = env::var("MIGRATOR_LOG_LEVEL") {
            self.logging.level = level;
            self.sources.insert(
                "logging.level".to_string(),
                ConfigSource::EnvVar("MIGRATOR_LOG_LEVEL".to_string()),
            );
        }

        if let Ok(format) = env::var("MIGRATOR_LOG_FORMAT") {
            self.logging.format = format.parse()?;
            self.sources.insert(
                "logging.format".to_string(),
                ConfigSource::EnvVar("MIGRATOR_LOG_FORMAT".to_string()),
            );
        }

        Ok(())
    }

    /// Apply command line values
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database_url = Some(url);
            self.sources.insert(
                "database_url".to_string(),
                ConfigSource::CommandLine("--database".to_string()),
            );
        }
        if let Some(dir) = overrides.migrations_dir {
            self.migrations_dir = dir;
            self.sources.insert(
                "migrations_dir".to_string(),
                ConfigSource::CommandLine("--path".to_string()),
            );
        }
        if let Some(table) = overrides.table_name {
            self.table_name = table;
            self.sources.insert(
                "table_name".to_string(),
                ConfigSource::CommandLine("--table".to_string()),
            );
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
            self.sources.insert(
                "logging.level".to_string(),
                ConfigSource::CommandLine("--log-level".to_string()),
            );
        }
    }

    /// The database URL, required by every command that touches the ledger
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or_else(|| {
            ConfigError::missing_required(
                "database_url",
                "Pass --database, set MIGRATOR_DATABASE_URL/DATABASE_URL, or add database_url to the config file",
            )
        })
    }

    /// Where a field's value came from
    pub fn source_of(&self, field: &str) -> Option<&ConfigSource> {
        self.sources.get(field)
    }
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AppConfigTrait for MigratorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new();
        config.merge_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.database_url {
            DatabaseUrlValidator.validate(url.as_str())?;
        }

        IdentifierValidator { field: "table_name" }.validate(self.table_name.as_str())?;
        LogLevelValidator.validate(self.logging.level.as_str())?;

        if self.migrations_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid_value(
                "migrations_dir",
                "",
                "a non-empty directory path",
            ));
        }

        Ok(())
    }

    fn config_sources(&self) -> HashMap<String, ConfigSource> {
        self.sources.clone()
    }
}
