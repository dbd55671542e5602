//! Per-target database: messages, peers seen in the target, admin events,
//! media, web page media and the subsystem queue.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::schema::{ResourceKind, CHAT_MIGRATIONS};
use super::{format_ts, get_conn, open_pool, parse_ts, resource, DbPool, StoreLayout};
use crate::dedup::DedupEngine;
use crate::target::Target;

#[derive(Clone)]
pub struct ChatDb {
    pool: DbPool,
    target: Target,
    dir: PathBuf,
}

impl ChatDb {
    pub fn open(layout: &StoreLayout, target: Target, pool_size: u32) -> anyhow::Result<Self> {
        let pool = open_pool(&layout.chat_db_path(target.target_id), "chat", CHAT_MIGRATIONS, pool_size)?;
        Ok(Self {
            pool,
            target,
            dir: layout.chat_dir(target.target_id),
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// The target's directory; media paths are stored relative to it.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn conn(&self) -> anyhow::Result<super::PooledConn> {
        get_conn(&self.pool)
    }

    /// Marks each known id deleted. Returns how many rows changed.
    pub fn mark_deleted(
        conn: &Connection,
        engine: &DedupEngine,
        ids: &[i64],
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let mut changed = 0;
        for id in ids {
            if resource::mark_message_deleted(conn, engine, *id, observed_at)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn is_known_message(conn: &Connection, id: i64) -> anyhow::Result<bool> {
        Ok(conn
            .query_row("SELECT 1 FROM messages WHERE id = ?1 LIMIT 1", [id], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Stored ids strictly between `low` and `high`.
    pub fn known_ids_between(conn: &Connection, low: i64, high: i64) -> anyhow::Result<Vec<i64>> {
        let mut stmt = conn.prepare("SELECT DISTINCT id FROM messages WHERE id > ?1 AND id < ?2 ORDER BY id")?;
        let ids = stmt
            .query_map([low, high], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn known_ids_below(conn: &Connection, id: i64) -> anyhow::Result<Vec<i64>> {
        Self::known_ids_between(conn, i64::MIN, id)
    }

    /// The newest message sent before `before`, as `(id, datetime)`.
    pub fn newest_message_before(&self, before: DateTime<Utc>) -> anyhow::Result<Option<(i64, DateTime<Utc>)>> {
        let conn = self.conn()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, datetime FROM messages
                 WHERE datetime IS NOT NULL AND datetime < ?1
                 ORDER BY datetime DESC, id DESC LIMIT 1",
                [format_ts(&before)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        row.map(|(id, dt)| Ok::<_, anyhow::Error>((id, parse_ts(&dt)?))).transpose()
    }

    pub fn newest_message_id(&self) -> anyhow::Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT MAX(id) FROM messages", [], |r| r.get(0))?)
    }

    pub fn message_count(&self) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(DISTINCT id) FROM messages", [], |r| r.get(0))?)
    }

    pub fn version_count(&self, kind: ResourceKind, id: i64) -> anyhow::Result<i64> {
        resource::version_count(&*self.conn()?, kind, id)
    }

    /// Records that a web page preview used a media file. Identical
    /// associations are stored once.
    pub fn save_web_page_media(
        conn: &Connection,
        scheme_layer: i32,
        observed_at: DateTime<Utc>,
        web_page_id: i64,
        media_id: i64,
        media_json_path: &str,
    ) -> anyhow::Result<bool> {
        let exists = conn
            .query_row(
                "SELECT 1 FROM web_page_media WHERE web_page_id = ?1 AND media_id = ?2 AND media_json_path = ?3",
                params![web_page_id, media_id, media_json_path],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Ok(false);
        }
        conn.execute(
            "INSERT INTO web_page_media (archive_datetime, archive_tl_scheme_layer, web_page_id, media_id, media_json_path)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![format_ts(&observed_at), scheme_layer, web_page_id, media_id, media_json_path],
        )?;
        Ok(true)
    }

    pub fn web_page_media_count(&self) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM web_page_media", [], |r| r.get(0))?)
    }
}
