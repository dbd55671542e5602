//! Sequential schema migrations with a ledger table.
//!
//! Every step gets a `db_migrations` row. The row is committed with only a
//! `start_time` before the step runs; the step's body and its `end_time` are
//! committed together. A row left without an `end_time` means an earlier
//! process died mid-migration, and the database refuses to open.
//!
//! Each row also holds a blake3 checksum of the step's sql. A database whose
//! applied steps no longer match the code refuses to open as well.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, info, warn};

use super::format_ts;
use crate::error::ArchiveError;

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub id: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub fn checksum(&self) -> String {
        blake3::hash(self.sql.as_bytes()).to_hex().to_string()
    }
}

const LEDGER_SQL: &str = "CREATE TABLE IF NOT EXISTS db_migrations (
    migration_id INTEGER PRIMARY KEY,
    migration_name TEXT NOT NULL,
    start_time TEXT NOT NULL,
    end_time TEXT,
    checksum TEXT
)";

/// Applies migrations to a single connection.
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
    database: &'a str,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection, database: &'a str) -> Self {
        Self { conn, database }
    }

    /// Brings the database up to date. Steps run in increasing id order.
    pub fn apply(&mut self, migrations: &[Migration]) -> anyhow::Result<()> {
        self.conn.execute(LEDGER_SQL, [])?;
        self.ensure_checksum_column()?;
        self.check_ledger()?;
        self.check_checksums(migrations)?;

        let mut ordered: Vec<&Migration> = migrations.iter().collect();
        ordered.sort_by_key(|m| m.id);
        let current = self.current_version()?;
        info!("Current {} schema version: {}", self.database, current);

        for migration in ordered {
            if self.is_applied(migration.id)? {
                continue;
            }
            info!("Applying {} migration {} ({})", self.database, migration.id, migration.name);
            self.conn.execute(
                "INSERT INTO db_migrations (migration_id, migration_name, start_time, checksum)
                 VALUES (?1, ?2, ?3, ?4)",
                params![migration.id, migration.name, format_ts(&Utc::now()), migration.checksum()],
            )?;

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration.sql) {
                error!("Failed to apply {} migration {}: {}", self.database, migration.id, e);
                return Err(e.into());
            }
            tx.execute(
                "UPDATE db_migrations SET end_time = ?1 WHERE migration_id = ?2",
                params![format_ts(&Utc::now()), migration.id],
            )?;
            tx.commit()?;
            info!("Migration {} applied successfully", migration.id);
        }
        Ok(())
    }

    fn check_ledger(&self) -> anyhow::Result<()> {
        let unfinished: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT migration_id, migration_name FROM db_migrations
                 WHERE end_time IS NULL ORDER BY migration_id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match unfinished {
            Some((migration_id, migration_name)) => Err(ArchiveError::MigrationIncomplete {
                database: self.database.to_string(),
                migration_id,
                migration_name,
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Ledgers written before checksums were recorded lack the column.
    fn ensure_checksum_column(&self) -> anyhow::Result<()> {
        let mut stmt = self.conn.prepare("SELECT name FROM pragma_table_info('db_migrations')")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if !columns.iter().any(|c| c == "checksum") {
            self.conn.execute("ALTER TABLE db_migrations ADD COLUMN checksum TEXT", [])?;
        }
        Ok(())
    }

    /// Applied steps must still match the code. Steps recorded without a
    /// checksum adopt the current one.
    fn check_checksums(&self, migrations: &[Migration]) -> anyhow::Result<()> {
        for migration in migrations {
            let stored: Option<Option<String>> = self
                .conn
                .query_row(
                    "SELECT checksum FROM db_migrations WHERE migration_id = ?1",
                    [migration.id],
                    |row| row.get(0),
                )
                .optional()?;
            let expected = migration.checksum();
            match stored {
                None => {}
                Some(None) => {
                    warn!(
                        "{} migration {} has no recorded checksum, recording the current one",
                        self.database, migration.id
                    );
                    self.conn.execute(
                        "UPDATE db_migrations SET checksum = ?1 WHERE migration_id = ?2",
                        params![expected, migration.id],
                    )?;
                }
                Some(Some(actual)) if actual == expected => {}
                Some(Some(_)) => {
                    error!("{} migration {} was applied from different sql", self.database, migration.id);
                    return Err(ArchiveError::MigrationChecksumMismatch {
                        database: self.database.to_string(),
                        migration_id: migration.id,
                        migration_name: migration.name.to_string(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    pub fn current_version(&self) -> anyhow::Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(MAX(migration_id), 0) FROM db_migrations WHERE end_time IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn is_applied(&self, migration_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .conn
            .query_row(
                "SELECT 1 FROM db_migrations WHERE migration_id = ?1 AND end_time IS NOT NULL",
                [migration_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }
}
