//! # migrator-core
//!
//! Configuration and logging foundation shared by the migration engine and the
//! `migrator` command line tool.

pub mod config;
pub mod logging;

pub use config::{
    AppConfigTrait, ConfigOverrides, ConfigSource, LogFormat, LogSettings, MigrationKind,
    MigratorConfig,
};
pub use config::validation::ConfigError;
pub use logging::{init_logging, LoggingConfig};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tool name used in log targets and the default engine span
pub const TOOL_NAME: &str = "migrator";

/// Get tool version
pub fn version() -> &'static str {
    VERSION
}
