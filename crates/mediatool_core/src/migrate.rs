use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, params};

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        sql: include_str!("migrations/v001_baseline.sql"),
    },
    Migration {
        version: 2,
        name: "append_only",
        sql: include_str!("migrations/v002_append_only.sql"),
    },
    Migration {
        version: 3,
        name: "run_events",
        sql: include_str!("migrations/v003_run_events.sql"),
    },
];

/// Format steps applied while opening a journal.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Journal format version written by this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map(|migration| migration.version).unwrap_or(0)
}

/// Brings a journal up to the latest format. Journals written by a newer
/// build are rejected rather than guessed at.
pub fn run_migrations(connection: &Connection) -> Result<MigrateReport> {
    connection
        .execute_batch(FORMAT_TABLE)
        .context("failed to create schema_migrations table")?;

    let found = current_version(connection)?;
    if found > latest_version() {
        bail!(
            "journal format v{found} is newer than this build supports (v{})",
            latest_version()
        );
    }
    let pending = MIGRATIONS.iter().filter(|migration| migration.version > found);
    let mut applied = Vec::new();
    for migration in pending {
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to upgrade journal to v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let current_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version,
    })
}

/// Highest applied journal format, 0 for an empty file.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: Option<i64> = connection
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        })
        .context("failed to read journal format version")?;
    u32::try_from(version.unwrap_or(0)).context("journal format version out of range")
}

const FORMAT_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);";

/// One format step; the transaction rolls back when dropped uncommitted.
fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    let transaction = connection
        .unchecked_transaction()
        .context("failed to begin journal upgrade")?;
    transaction
        .execute_batch(migration.sql)
        .with_context(|| format!("journal format v{:03} did not apply", migration.version))?;
    transaction
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                i64::from(migration.version),
                migration.name,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
        .context("failed to record journal format version")?;
    transaction
        .commit()
        .context("failed to commit journal upgrade")
}

/// Every append is synced to disk before it returns.
pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection =
        Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .pragma_update(None, "journal_mode", "DELETE")
        .context("failed to set journal mode")?;
    connection
        .pragma_update(None, "synchronous", "FULL")
        .context("failed to set synchronous pragma")?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn fresh_journal_gets_every_format_step() {
        let temp = tempdir().expect("tempdir");
        let connection = open_connection(&temp.path().join("journal.db")).expect("open");
        let report = run_migrations(&connection).expect("run_migrations");
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.current_version, latest_version());
    }

    #[test]
    fn reopening_applies_nothing() {
        let temp = tempdir().expect("tempdir");
        let connection = open_connection(&temp.path().join("journal.db")).expect("open");
        run_migrations(&connection).expect("first run");
        let second = run_migrations(&connection).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 3);
    }

    #[test]
    fn older_journal_is_upgraded() {
        let temp = tempdir().expect("tempdir");
        let connection = open_connection(&temp.path().join("journal.db")).expect("open");
        connection.execute_batch(FORMAT_TABLE).expect("table");
        apply_migration(&connection, &MIGRATIONS[0]).expect("baseline");
        assert_eq!(current_version(&connection).expect("version"), 1);

        let report = run_migrations(&connection).expect("upgrade");
        let names: Vec<&str> = report
            .applied
            .iter()
            .map(|migration| migration.name.as_str())
            .collect();
        assert_eq!(names, vec!["append_only", "run_events"]);
    }

    #[test]
    fn newer_journal_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let connection = open_connection(&temp.path().join("journal.db")).expect("open");
        run_migrations(&connection).expect("migrate");
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (99, 'future', '')",
                [],
            )
            .expect("insert");
        let error = run_migrations(&connection).expect_err("must reject");
        assert!(error.to_string().contains("newer than this build"));
    }
}
