mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::migrate;
use migrator_core::{
    init_logging, AppConfigTrait, ConfigOverrides, LoggingConfig, MigrationKind, MigratorConfig,
};
use migrator_engine::ExecutionContext;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "migrator")]
#[command(version, about = "Versioned SQL schema migrations with a durable ledger")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL
    #[arg(long, global = true)]
    database: Option<String>,

    /// Migrations directory
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// Ledger table name
    #[arg(long, global = true)]
    table: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the next migration's up and down files
    Create {
        /// Migration name (letters, digits and '-')
        name: String,

        /// sql or script; defaults to the configured kind
        #[arg(long)]
        kind: Option<MigrationKind>,
    },

    /// Apply all pending migrations
    Up,

    /// Roll back the last applied migration
    Down,

    /// Roll back and re-apply the last applied migration
    Redo,

    /// Show the migration ledger
    Status,

    /// Print the last applied version
    #[command(name = "dbversion")]
    DbVersion,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            database_url: self.database.clone(),
            migrations_dir: self.path.clone(),
            table_name: self.table.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

/// Cancel `ctx` on Ctrl-C so the running step is aborted and recorded as failed
fn cancel_on_interrupt(ctx: &ExecutionContext) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling the current migration");
            ctx.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = MigratorConfig::load(cli.config.as_deref(), cli.overrides())
        .context("invalid configuration")?;
    init_logging(
        LoggingConfig::from_settings(&config.logging)
            .with_global_field("tool", migrator_core::TOOL_NAME)
            .with_global_field("version", migrator_core::version()),
    )?;
    let mut sources: Vec<_> = config.config_sources().into_iter().collect();
    sources.sort_by(|a, b| a.0.cmp(&b.0));
    for (field, source) in sources {
        tracing::debug!(field = %field, source = %source, "Configuration value");
    }

    let ctx = ExecutionContext::new();
    cancel_on_interrupt(&ctx);

    let result = match cli.command {
        Commands::Create { name, kind } => migrate::create(&config, &name, kind),
        Commands::Up => migrate::up(&config, &ctx).await,
        Commands::Down => migrate::down(&config, &ctx).await,
        Commands::Redo => migrate::redo(&config, &ctx).await,
        Commands::Status => migrate::status(&config, &ctx).await,
        Commands::DbVersion => migrate::db_version(&config, &ctx).await,
    };

    if let Err(e) = &result {
        tracing::error!("Command failed: {:#}", e);
    }
    result
}
