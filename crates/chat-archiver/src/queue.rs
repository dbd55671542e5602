//! Durable per-target work queue shared by the fetcher subsystems.
//!
//! Entries live in the target's `subsystem_queue` table and are only deleted
//! once the work they describe has been committed, so whatever is left in the
//! table when a process starts is exactly the work still owed. A dequeued
//! entry is leased in memory until it is acked or released, which keeps two
//! workers from picking up the same row.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashSet;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::ArchiveError;
use crate::store::{get_conn, with_transaction, DbPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subsystem {
    History,
    Live,
    Media,
    Sticker,
    Peer,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::History,
        Subsystem::Live,
        Subsystem::Media,
        Subsystem::Sticker,
        Subsystem::Peer,
    ];

    /// Subsystems whose work belongs to the history backfill phase.
    pub const BACKFILL: [Subsystem; 4] = [Subsystem::History, Subsystem::Media, Subsystem::Sticker, Subsystem::Peer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::History => "HistoryFetcher",
            Subsystem::Live => "LiveFollower",
            Subsystem::Media => "MediaDownloader",
            Subsystem::Sticker => "StickerDownloader",
            Subsystem::Peer => "PeerDataFetcher",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subsystem {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subsystem::ALL
            .iter()
            .copied()
            .find(|sub| sub.as_str() == s)
            .ok_or_else(|| ArchiveError::UnknownSubsystem(s.to_string()))
    }
}

/// Work waiting to be written to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub subsystem: Subsystem,
    pub message_id: Option<i64>,
    pub extra_data: serde_json::Value,
}

impl NewEntry {
    pub fn new(subsystem: Subsystem, message_id: Option<i64>, extra_data: serde_json::Value) -> Self {
        Self { subsystem, message_id, extra_data }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub queue_entry_id: i64,
    pub subsystem: Subsystem,
    pub message_id: Option<i64>,
    pub extra_data: serde_json::Value,
}

pub struct SubsystemQueue {
    pool: DbPool,
    leased: DashSet<i64>,
    wakers: HashMap<Subsystem, Arc<Notify>>,
}

impl SubsystemQueue {
    pub fn new(pool: DbPool) -> Self {
        let wakers = Subsystem::ALL.iter().map(|s| (*s, Arc::new(Notify::new()))).collect();
        Self {
            pool,
            leased: DashSet::new(),
            wakers,
        }
    }

    /// Inserts inside an open transaction. Call [`Self::notify`] after commit.
    pub fn enqueue_in(conn: &Connection, entry: &NewEntry) -> anyhow::Result<i64> {
        conn.execute(
            "INSERT INTO subsystem_queue (subsystem_name, message_id, extra_data) VALUES (?1, ?2, ?3)",
            params![entry.subsystem.as_str(), entry.message_id, entry.extra_data.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn enqueue(&self, entry: &NewEntry) -> anyhow::Result<i64> {
        let id = with_transaction(&self.pool, |tx| Self::enqueue_in(tx, entry))?;
        debug!("Queued {} entry {}", entry.subsystem, id);
        self.notify(entry.subsystem);
        Ok(id)
    }

    /// Oldest unleased entry for the subsystem, leased to the caller.
    pub fn dequeue(&self, subsystem: Subsystem) -> anyhow::Result<Option<QueueEntry>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT queue_entry_id, message_id, extra_data FROM subsystem_queue
             WHERE subsystem_name = ?1 ORDER BY queue_entry_id",
        )?;
        let mut rows = stmt.query([subsystem.as_str()])?;
        while let Some(row) = rows.next()? {
            let queue_entry_id: i64 = row.get(0)?;
            if !self.leased.insert(queue_entry_id) {
                continue;
            }
            let extra: String = row.get(2)?;
            let extra_data = match serde_json::from_str(&extra) {
                Ok(value) => value,
                Err(e) => {
                    self.leased.remove(&queue_entry_id);
                    return Err(ArchiveError::InvalidQueueEntry {
                        entry_id: queue_entry_id,
                        reason: e.to_string(),
                    }
                    .into());
                }
            };
            return Ok(Some(QueueEntry {
                queue_entry_id,
                subsystem,
                message_id: row.get(1)?,
                extra_data,
            }));
        }
        Ok(None)
    }

    /// Deletes the entry inside an open transaction. Call [`Self::release`]
    /// after commit.
    pub fn ack_in(conn: &Connection, queue_entry_id: i64) -> anyhow::Result<()> {
        conn.execute("DELETE FROM subsystem_queue WHERE queue_entry_id = ?1", [queue_entry_id])?;
        Ok(())
    }

    pub fn ack(&self, queue_entry_id: i64) -> anyhow::Result<()> {
        with_transaction(&self.pool, |tx| Self::ack_in(tx, queue_entry_id))?;
        self.release(queue_entry_id);
        Ok(())
    }

    /// Drops the in-memory lease. An unacked entry becomes dequeueable again.
    pub fn release(&self, queue_entry_id: i64) {
        self.leased.remove(&queue_entry_id);
    }

    pub fn notify(&self, subsystem: Subsystem) {
        if let Some(waker) = self.wakers.get(&subsystem) {
            waker.notify_one();
        }
    }

    pub fn notify_all(&self) {
        for waker in self.wakers.values() {
            waker.notify_one();
        }
    }

    pub fn waker(&self, subsystem: Subsystem) -> Arc<Notify> {
        self.wakers
            .get(&subsystem)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }

    pub fn len(&self, subsystem: Subsystem) -> anyhow::Result<i64> {
        let conn = get_conn(&self.pool)?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM subsystem_queue WHERE subsystem_name = ?1",
            [subsystem.as_str()],
            |r| r.get(0),
        )?)
    }

    pub fn total_len(&self) -> anyhow::Result<i64> {
        let conn = get_conn(&self.pool)?;
        Ok(conn.query_row("SELECT COUNT(*) FROM subsystem_queue", [], |r| r.get(0))?)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.total_len()? == 0)
    }

    /// True when no entry, leased or not, remains for any of `subsystems`.
    pub fn is_drained(&self, subsystems: &[Subsystem]) -> anyhow::Result<bool> {
        for subsystem in subsystems {
            if self.len(*subsystem)? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every persisted entry, oldest first.
    pub fn pending(&self) -> anyhow::Result<Vec<QueueEntry>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(
            "SELECT queue_entry_id, subsystem_name, message_id, extra_data FROM subsystem_queue ORDER BY queue_entry_id",
        )?;
        let raw = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<i64>>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(queue_entry_id, name, message_id, extra)| {
                Ok(QueueEntry {
                    queue_entry_id,
                    subsystem: name.parse()?,
                    message_id,
                    extra_data: serde_json::from_str(&extra)?,
                })
            })
            .collect()
    }
}
