//! Scaffolding for new migration files

use crate::definition::Direction;
use crate::error::{MigrateError, MigrateResult};
use crate::source::loader::leading_version;
use migrator_core::MigrationKind;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

static MIGRATION_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("valid migration name regex"));

/// Files written by `create_migration`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedMigration {
    pub version: i64,
    pub up: PathBuf,
    pub down: PathBuf,
}

/// Highest version prefix found in `dir`, 0 when there is none
pub fn last_version(dir: &Path) -> MigrateResult<i64> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut last = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(digits) = file_name.to_str().and_then(leading_version) else {
            continue;
        };
        let version: i64 = digits.parse().map_err(|_| {
            MigrateError::Source(format!("version in '{}' is out of range", digits))
        })?;
        last = last.max(version);
    }
    Ok(last)
}

fn script_template(version: i64, name: &str, direction: Direction) -> String {
    format!(
        "#!/bin/sh\n\
         # Migration {version:05} {name} ({direction})\n\
         # DATABASE_URL, MIGRATION_VERSION and MIGRATION_NAME are provided by migrator.\n\
         set -e\n\
         \n\
         # psql \"$DATABASE_URL\" -v ON_ERROR_STOP=1 <<'SQL'\n\
         # SQL\n"
    )
}

fn write_new(path: &Path, content: &str) -> MigrateResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| {
            MigrateError::Source(format!("failed to create {}: {}", path.display(), e))
        })?;
    file.write_all(content.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if !content.is_empty() {
            fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
        }
    }

    Ok(())
}

/// Write the up/down pair for the next version in `dir`
pub fn create_migration(
    dir: &Path,
    name: &str,
    kind: MigrationKind,
) -> MigrateResult<CreatedMigration> {
    if !MIGRATION_NAME.is_match(name) {
        return Err(MigrateError::Source(format!(
            "invalid migration name '{}': use letters, digits and '-'",
            name
        )));
    }

    fs::create_dir_all(dir)?;
    let version = last_version(dir)? + 1;
    let path_for = |direction: Direction| {
        dir.join(format!(
            "{:05}_{}_{}.{}",
            version,
            name,
            direction,
            kind.extension()
        ))
    };

    let created = CreatedMigration {
        version,
        up: path_for(Direction::Up),
        down: path_for(Direction::Down),
    };

    for (direction, path) in [(Direction::Up, &created.up), (Direction::Down, &created.down)] {
        let content = match kind {
            MigrationKind::Sql => String::new(),
            MigrationKind::Script => script_template(version, name, direction),
        };
        write_new(path, &content)?;
        tracing::info!(file = %path.display(), "Created migration file");
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::loader::load_migrations;

    #[test]
    fn test_creates_next_version() {
        let dir = tempfile::tempdir().unwrap();
        let first = create_migration(dir.path(), "create-users", MigrationKind::Sql).unwrap();
        assert_eq!(first.version, 1);
        assert!(first.up.ends_with("00001_create-users_up.sql"));
        assert_eq!(fs::read_to_string(&first.down).unwrap(), "");

        let second = create_migration(dir.path(), "add-email", MigrationKind::Sql).unwrap();
        assert_eq!(second.version, 2);

        // Scaffolded files load back as a contiguous source
        let definitions = load_migrations(dir.path(), None).unwrap();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[1].name, "add-email");
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("db").join("migrations");
        let created = create_migration(&nested, "init", MigrationKind::Sql).unwrap();
        assert!(created.up.exists());
    }

    #[test]
    fn test_script_template() {
        let dir = tempfile::tempdir().unwrap();
        let created = create_migration(dir.path(), "seed", MigrationKind::Script).unwrap();
        assert!(created.down.ends_with("00001_seed_down.sh"));

        let body = fs::read_to_string(&created.up).unwrap();
        assert!(body.starts_with("#!/bin/sh\n"));
        assert!(body.contains("Migration 00001 seed (up)"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&created.up).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["", "create_users", "drop table", "../escape"] {
            assert!(matches!(
                create_migration(dir.path(), name, MigrationKind::Sql),
                Err(MigrateError::Source(_))
            ));
        }
    }

    #[test]
    fn test_last_version_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("00007_x_up.sql"), "").unwrap();
        fs::write(dir.path().join("README.md"), "").unwrap();
        assert_eq!(last_version(dir.path()).unwrap(), 7);
        assert_eq!(last_version(&dir.path().join("absent")).unwrap(), 0);
    }
}
