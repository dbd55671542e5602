//! On-disk archive store.
//!
//! One shared core database plus one self-contained database and media
//! directory per target:
//!
//! ```text
//! <root>/core_db.sqlite
//! <root>/chats/<target_id>/chat_db.sqlite
//! <root>/chats/<target_id>/media/
//! <root>/chats/<target_id>/web_page_media/
//! <root>/stickers/<pack_id>/<sticker_id>.webp
//! ```
pub mod chat_db;
pub mod core_db;
pub mod migration;
pub mod resource;
pub mod schema;

pub use chat_db::ChatDb;
pub use core_db::CoreDb;
pub use migration::{Migration, MigrationManager};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::TransactionBehavior;
use tracing::{debug, info};

pub type DbPool = Arc<Pool<SqliteConnectionManager>>;
pub type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

pub const UNKNOWN_STICKER_PACK: &str = "Unknown";
pub const DEFAULT_STICKER_EXT: &str = "webp";

/// Path arithmetic for a store root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn core_db_path(&self) -> PathBuf {
        self.root.join("core_db.sqlite")
    }

    pub fn chat_dir(&self, target_id: i64) -> PathBuf {
        self.root.join("chats").join(target_id.to_string())
    }

    pub fn chat_db_path(&self, target_id: i64) -> PathBuf {
        self.chat_dir(target_id).join("chat_db.sqlite")
    }

    pub fn media_dir(&self, target_id: i64) -> PathBuf {
        self.chat_dir(target_id).join("media")
    }

    pub fn web_page_media_dir(&self, target_id: i64) -> PathBuf {
        self.chat_dir(target_id).join("web_page_media")
    }

    pub fn sticker_dir(&self, sticker_set_id: Option<i64>) -> PathBuf {
        let pack = sticker_set_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| UNKNOWN_STICKER_PACK.to_string());
        self.root.join("stickers").join(pack)
    }

    pub fn sticker_path(&self, sticker_set_id: Option<i64>, sticker_id: i64, file_ext: Option<&str>) -> PathBuf {
        let ext = file_ext.filter(|e| !e.is_empty()).unwrap_or(DEFAULT_STICKER_EXT);
        self.sticker_dir(sticker_set_id).join(format!("{}.{}", sticker_id, ext))
    }
}

/// Opens a pooled database, bringing its schema up to date first.
pub fn open_pool(
    db_path: &Path,
    database: &str,
    migrations: &[Migration],
    max_size: u32,
) -> anyhow::Result<DbPool> {
    info!("Opening {} database at: {}", database, db_path.display());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create store directory {}", parent.display()))?;
    }
    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_millis(5000))?;
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA synchronous = NORMAL;",
            )
        });
    let pool = Pool::builder()
        .max_size(max_size.max(1))
        .build(manager)
        .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

    {
        let mut conn = pool.get()?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("{} journal mode: {}", database, mode);
        let mut migrator = MigrationManager::new(&mut conn, database);
        migrator.apply(migrations)?;
    }
    info!("{} database ready", database);
    Ok(Arc::new(pool))
}

pub fn get_conn(pool: &DbPool) -> anyhow::Result<PooledConn> {
    pool.get().map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
}

/// Runs `f` inside an immediate transaction. Anything `f` wrote is rolled
/// back when it returns an error.
pub fn with_transaction<T, F>(pool: &DbPool, f: F) -> anyhow::Result<T>
where
    F: FnOnce(&rusqlite::Transaction<'_>) -> anyhow::Result<T>,
{
    let mut conn = get_conn(pool)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn format_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid stored timestamp: {}", s))?
        .with_timezone(&Utc))
}

pub fn parse_opt_ts(s: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = StoreLayout::new("/data/store");
        assert_eq!(layout.core_db_path(), PathBuf::from("/data/store/core_db.sqlite"));
        assert_eq!(layout.chat_db_path(12), PathBuf::from("/data/store/chats/12/chat_db.sqlite"));
        assert_eq!(layout.media_dir(12), PathBuf::from("/data/store/chats/12/media"));
        assert_eq!(layout.web_page_media_dir(12), PathBuf::from("/data/store/chats/12/web_page_media"));
        assert_eq!(
            layout.sticker_path(Some(7), 99, None),
            PathBuf::from("/data/store/stickers/7/99.webp")
        );
        assert_eq!(
            layout.sticker_path(None, 99, Some("tgs")),
            PathBuf::from("/data/store/stickers/Unknown/99.tgs")
        );
    }

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = parse_ts("2024-01-01T00:00:00Z").unwrap();
        let late = parse_ts("2024-01-01T00:00:00.5+00:00").unwrap();
        assert!(format_ts(&early) < format_ts(&late));
        assert_eq!(parse_ts(&format_ts(&late)).unwrap(), late);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("t.sqlite"), "test", &[], 2).unwrap();
        with_transaction(&pool, |tx| {
            tx.execute_batch("CREATE TABLE t (v INTEGER)")?;
            Ok(())
        })
        .unwrap();
        let failed: anyhow::Result<()> = with_transaction(&pool, |tx| {
            tx.execute("INSERT INTO t (v) VALUES (1)", [])?;
            anyhow::bail!("boom")
        });
        assert!(failed.is_err());
        let conn = get_conn(&pool).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }
}
