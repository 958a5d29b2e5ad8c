//! Reads migration definitions from a directory
//!
//! Files follow `<version>_<name>_<up|down>.<sql|sh>`, e.g. `00003_add-index_up.sql`.

use crate::definition::{Action, Direction, MigrationDefinition};
use crate::error::{MigrateError, MigrateResult};
use crate::source::script::ScriptProcedure;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

static FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+)_([A-Za-z0-9-]+)_(up|down)\.(sql|sh)$").expect("valid migration file regex")
});

/// Leading digit run of a file name, if any
pub(crate) fn leading_version(file_name: &str) -> Option<&str> {
    let end = file_name
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(file_name.len());
    (end > 0).then(|| &file_name[..end])
}

/// One recognised migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MigrationFile {
    pub version: i64,
    pub name: String,
    pub direction: Direction,
    pub script: bool,
    pub path: PathBuf,
}

/// Classify a directory entry: `Ok(None)` for files that are not migrations
pub(crate) fn parse_file_name(path: &Path) -> MigrateResult<Option<MigrationFile>> {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    if leading_version(file_name).is_none() {
        return Ok(None);
    }

    let captures = FILE_NAME.captures(file_name).ok_or_else(|| {
        MigrateError::Source(format!(
            "invalid migration file name '{}': expected <version>_<name>_<up|down>.<sql|sh>",
            file_name
        ))
    })?;

    let version: i64 = captures[1].parse().map_err(|_| {
        MigrateError::Source(format!("version in '{}' is out of range", file_name))
    })?;
    if version == 0 {
        return Err(MigrateError::Source(format!(
            "invalid migration file name '{}': versions start at 1",
            file_name
        )));
    }

    Ok(Some(MigrationFile {
        version,
        name: captures[2].to_string(),
        direction: if &captures[3] == "up" {
            Direction::Up
        } else {
            Direction::Down
        },
        script: &captures[4] == "sh",
        path: path.to_path_buf(),
    }))
}

#[derive(Default)]
struct Pending {
    name: String,
    up: Option<Action>,
    down: Option<Action>,
}

/// Load every migration in `dir`, ordered and contiguous from version 1.
///
/// A missing directory yields no migrations.
pub fn load_migrations(
    dir: &Path,
    database_url: Option<&str>,
) -> MigrateResult<Vec<MigrationDefinition>> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "Migrations directory does not exist");
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut pending: BTreeMap<i64, Pending> = BTreeMap::new();
    for path in paths {
        let Some(file) = parse_file_name(&path)? else {
            tracing::debug!(file = %path.display(), "Skipping non-migration file");
            continue;
        };

        let action = if file.script {
            Action::procedure(
                ScriptProcedure::new(&file.path, file.version, file.name.clone())
                    .with_database_url(database_url.map(str::to_string)),
            )
        } else {
            Action::sql(fs::read_to_string(&file.path)?)
        };

        let entry = pending.entry(file.version).or_insert_with(|| Pending {
            name: file.name.clone(),
            ..Pending::default()
        });
        if entry.name != file.name {
            return Err(MigrateError::Source(format!(
                "version {} has mismatched names '{}' and '{}'",
                file.version, entry.name, file.name
            )));
        }

        let slot = match file.direction {
            Direction::Up => &mut entry.up,
            Direction::Down => &mut entry.down,
        };
        if slot.is_some() {
            return Err(MigrateError::Source(format!(
                "duplicate {} migration for version {}",
                file.direction, file.version
            )));
        }
        *slot = Some(action);
    }

    for (index, version) in pending.keys().enumerate() {
        let expected = index as i64 + 1;
        if *version != expected {
            return Err(MigrateError::Source(format!(
                "migration versions must be contiguous from 1: expected {}, found {}",
                expected, version
            )));
        }
    }

    let definitions: Vec<MigrationDefinition> = pending
        .into_iter()
        .map(|(version, p)| {
            MigrationDefinition::new(version, p.name)
                .with_up(p.up.unwrap_or_default())
                .with_down(p.down.unwrap_or_default())
        })
        .collect();

    tracing::debug!(dir = %dir.display(), count = definitions.len(), "Loaded migrations");
    Ok(definitions)
}
