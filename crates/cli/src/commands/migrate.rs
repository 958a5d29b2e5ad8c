use anyhow::{Context, Result};
use migrator_core::{MigrationKind, MigratorConfig};
use migrator_engine::{
    ExecutionContext, MigrateResult, MigrationSource, Migrator, PostgresLedger,
};
use std::sync::Arc;

/// Scaffold the next migration pair in the configured directory
pub fn create(config: &MigratorConfig, name: &str, kind: Option<MigrationKind>) -> Result<()> {
    let kind = kind.unwrap_or(config.migration_kind);
    let created = MigrationSource::from_config(config)
        .create(name, kind)
        .with_context(|| format!("failed to create migration '{}'", name))?;

    println!("Created migration {:05}:", created.version);
    println!("  {}", created.up.display());
    println!("  {}", created.down.display());
    Ok(())
}

pub async fn up(config: &MigratorConfig, ctx: &ExecutionContext) -> Result<()> {
    let migrator = open(config, "up", true).await?;
    let result = migrator.up(ctx).await;
    let report = finish(migrator, result).await.context("up failed")?;

    match report.last() {
        Some(last) => println!(
            "Applied {} migration(s), database is at version {}",
            report.applied.len(),
            last
        ),
        None => println!("Database is up to date"),
    }
    Ok(())
}

pub async fn down(config: &MigratorConfig, ctx: &ExecutionContext) -> Result<()> {
    let migrator = open(config, "down", true).await?;
    let result = migrator.down(ctx).await;
    let record = finish(migrator, result).await.context("down failed")?;

    println!("Rolled back migration {} ({})", record.version, record.name);
    Ok(())
}

pub async fn redo(config: &MigratorConfig, ctx: &ExecutionContext) -> Result<()> {
    let migrator = open(config, "redo", true).await?;
    let result = migrator.redo(ctx).await;
    let version = finish(migrator, result).await.context("redo failed")?;

    println!("Redid migration {}", version);
    Ok(())
}

pub async fn status(config: &MigratorConfig, ctx: &ExecutionContext) -> Result<()> {
    let migrator = open(config, "status", false).await?;
    let result = migrator.status(ctx).await;
    let report = finish(migrator, result).await.context("status failed")?;

    print!("{}", report);
    Ok(())
}

pub async fn db_version(config: &MigratorConfig, ctx: &ExecutionContext) -> Result<()> {
    let migrator = open(config, "dbversion", false).await?;
    let result = migrator.db_version(ctx).await;
    let version = finish(migrator, result).await.context("dbversion failed")?;

    println!("{}", version);
    Ok(())
}

/// Build a connected engine. Status and dbversion only read the ledger and skip the source.
async fn open(config: &MigratorConfig, command: &'static str, load: bool) -> Result<Migrator> {
    let definitions = if load {
        let source = MigrationSource::from_config(config);
        source
            .load()
            .with_context(|| format!("failed to load migrations from {}", source.dir().display()))?
    } else {
        Vec::new()
    };

    let store = PostgresLedger::from_config(config)?;
    let migrator = Migrator::new(Arc::new(store), definitions)
        .with_span(tracing::info_span!("migrator", command));

    migrator
        .connect()
        .await
        .context("failed to connect to the database")?;
    Ok(migrator)
}

/// Close the session whatever the outcome, then surface the operation's result
async fn finish<T>(migrator: Migrator, result: MigrateResult<T>) -> Result<T> {
    if let Err(e) = migrator.close().await {
        tracing::warn!(error = %e, "Failed to close ledger connection");
    }
    Ok(result?)
}
