//! History fetcher: pages backwards through a target's message history, and
//! archives its admin log.
//!
//! Each page entry queues the next one in the same transaction that stores
//! the page, so the walk resumes exactly where the last commit left it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::messages::{delete_messages, write_earlier_message, write_message};
use super::{decode_work, ProcessOutcome, ResourceFetcher, RunContext, Tally};
use crate::dedup::Decision;
use crate::error::ClientError;
use crate::protocol::RawObject;
use crate::queue::{NewEntry, QueueEntry, Subsystem};
use crate::run_record::Stat;
use crate::store::schema::{admin_event_row, AdminAction};
use crate::store::{resource, ChatDb};

/// Messages newer than this at queue time may still be in flux and do not
/// anchor the backfill horizon.
const HORIZON_SETTLE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Fetch messages below this id; `None` starts at the newest.
    #[serde(default)]
    pub offset_id: Option<i64>,
    /// Catch-up walks end once they reach this id.
    #[serde(default)]
    pub stop_at_id: Option<i64>,
    /// A message older than this ends the walk. `None` walks to the start.
    #[serde(default)]
    pub horizon: Option<DateTime<Utc>>,
    /// Oldest message of the previous page, and whether it was stored before.
    #[serde(default)]
    pub prev_id: Option<i64>,
    #[serde(default)]
    pub prev_known: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryWork {
    Page(PageCursor),
    AdminLog,
}

impl HistoryWork {
    pub fn entry(&self) -> NewEntry {
        NewEntry::new(
            Subsystem::History,
            None,
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }

    /// First page of a backfill, bounded by what the store already holds.
    pub fn backfill(chat_db: &ChatDb, time_queued: DateTime<Utc>, overlap_days: u32) -> anyhow::Result<Self> {
        Ok(HistoryWork::Page(PageCursor {
            horizon: backfill_horizon(chat_db, time_queued, overlap_days)?,
            ..PageCursor::default()
        }))
    }

    /// Walks from the newest message down to `stop_at_id`.
    pub fn catch_up(stop_at_id: Option<i64>) -> Self {
        HistoryWork::Page(PageCursor {
            stop_at_id,
            ..PageCursor::default()
        })
    }
}

/// The newest settled stored message minus the overlap. `None` means the
/// whole history is walked.
pub fn backfill_horizon(
    chat_db: &ChatDb,
    time_queued: DateTime<Utc>,
    overlap_days: u32,
) -> anyhow::Result<Option<DateTime<Utc>>> {
    if overlap_days == 0 {
        return Ok(None);
    }
    let settled = time_queued - Duration::minutes(HORIZON_SETTLE_MINUTES);
    Ok(chat_db
        .newest_message_before(settled)?
        .map(|(_, newest)| newest - Duration::days(overlap_days as i64)))
}

pub struct HistoryFetcher;

impl HistoryFetcher {
    async fn page(&self, ctx: &RunContext, entry: &QueueEntry, cursor: PageCursor) -> anyhow::Result<ProcessOutcome> {
        let target = ctx.target();
        let page = match ctx
            .client
            .history_page(&target, cursor.offset_id, ctx.config.history_page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                // the walk cannot continue past a page it could not read
                ctx.tolerate_malformed(&format!("history page below {:?}", cursor.offset_id), e)?;
                return ctx.commit(entry, |_, _| Ok(Vec::new()));
            }
        };
        debug!("History page below {:?} for {}: {} messages", cursor.offset_id, target, page.len());
        let observed_at = Utc::now();
        let overlap = Duration::days(ctx.behaviour.msg_history_overlap_days as i64);

        ctx.commit(entry, |tx, tally| {
            let mut derived = Vec::new();
            let mut next = cursor.clone();
            let mut done = page.is_empty();
            for raw in &page {
                if cursor.stop_at_id.map_or(false, |stop| raw.id <= stop) {
                    done = true;
                    break;
                }
                let known = ChatDb::is_known_message(tx, raw.id)?;
                if let Some(prev_id) = next.prev_id {
                    if next.prev_known && known && prev_id - raw.id > 1 {
                        let gone = ChatDb::known_ids_between(tx, raw.id, prev_id)?;
                        if !gone.is_empty() {
                            debug!("Messages {:?} vanished from {}", gone, target);
                            delete_messages(ctx, tx, tally, &gone, observed_at)?;
                        }
                    }
                }

                let write = write_message(ctx, tx, tally, raw, observed_at)?;
                derived.extend(write.derived.iter().cloned());
                if let (true, Some(sent), Some(horizon)) = (write.changed(), write.datetime, next.horizon) {
                    next.horizon = Some(horizon.min(sent - overlap));
                }
                next.offset_id = Some(raw.id);
                next.prev_id = Some(raw.id);
                next.prev_known = known;
                if let (Some(sent), Some(horizon)) = (write.datetime, next.horizon) {
                    if sent < horizon {
                        debug!("Reached the backfill horizon for {} at message {}", target, raw.id);
                        done = true;
                        break;
                    }
                }
            }

            if page.is_empty() && cursor.stop_at_id.is_none() {
                info!("Reached the start of history for {}", target);
                if let Some(oldest) = cursor.prev_id {
                    let gone = ChatDb::known_ids_below(tx, oldest)?;
                    if !gone.is_empty() {
                        debug!("Messages {:?} vanished from the start of {}", gone, target);
                        delete_messages(ctx, tx, tally, &gone, observed_at)?;
                    }
                }
            }
            if !done {
                derived.push(HistoryWork::Page(next).entry());
            }
            Ok(derived)
        })
    }

    async fn admin_log(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome> {
        let target = ctx.target();
        let events = match ctx.client.admin_log(&target).await {
            Ok(events) => events,
            Err(ClientError::PermissionDenied(reason)) => {
                warn!("Skipping admin log for {}: {}", target, reason);
                return ctx.commit(entry, |_, _| Ok(Vec::new()));
            }
            Err(e) => {
                ctx.tolerate_malformed("admin log", e)?;
                return ctx.commit(entry, |_, _| Ok(Vec::new()));
            }
        };
        info!("Archiving {} admin log events for {}", events.len(), target);
        let layer = ctx.scheme_layer();
        let observed_at = Utc::now();

        ctx.commit(entry, |tx, tally| {
            let mut derived = Vec::new();
            for raw in &events {
                let extracted = admin_event_row(raw);
                for anomaly in &extracted.anomalies {
                    tally.anomaly(anomaly);
                }
                tally.inc(Stat::AdminEventsSeen);
                if resource::write(tx, &ctx.engine, &extracted.row, layer, observed_at)? != Decision::Skip {
                    tally.inc(Stat::AdminEventsSaved);
                }
                match &extracted.facts {
                    AdminAction::DeleteMessage(message) => {
                        derived.extend(store_if_unknown(ctx, tx, tally, message, observed_at)?);
                        delete_messages(ctx, tx, tally, &[message.id], observed_at)?;
                    }
                    // Known messages keep their newest content; the event row holds both versions.
                    AdminAction::EditMessage { previous, new } => {
                        if !ChatDb::is_known_message(tx, new.id)? {
                            derived.extend(write_message(ctx, tx, tally, new, observed_at)?.derived);
                            derived.extend(write_earlier_message(ctx, tx, tally, previous, observed_at)?);
                        }
                    }
                    AdminAction::Other => {}
                }
            }
            Ok(derived)
        })
    }
}

fn store_if_unknown(
    ctx: &RunContext,
    conn: &Connection,
    tally: &mut Tally,
    message: &RawObject,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<Vec<NewEntry>> {
    if ChatDb::is_known_message(conn, message.id)? {
        return Ok(Vec::new());
    }
    Ok(write_message(ctx, conn, tally, message, observed_at)?.derived)
}

#[async_trait]
impl ResourceFetcher for HistoryFetcher {
    fn subsystem(&self) -> Subsystem {
        Subsystem::History
    }

    async fn process(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome> {
        match decode_work::<HistoryWork>(entry)? {
            HistoryWork::Page(cursor) => self.page(ctx, entry, cursor).await,
            HistoryWork::AdminLog => self.admin_log(ctx, entry).await,
        }
    }
}
