//! Message writes shared by the history fetcher and the live follower.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::media::MediaWork;
use super::peer::PeerWork;
use super::sticker::StickerWork;
use super::{RunContext, Tally};
use crate::dedup::Decision;
use crate::protocol::RawObject;
use crate::queue::NewEntry;
use crate::run_record::Stat;
use crate::store::resource;
use crate::store::schema::{message_row, MessageFacts};
use crate::store::ChatDb;

#[derive(Debug)]
pub struct MessageWrite {
    pub decision: Decision,
    pub datetime: Option<DateTime<Utc>>,
    pub derived: Vec<NewEntry>,
}

impl MessageWrite {
    pub fn changed(&self) -> bool {
        self.decision != Decision::Skip
    }
}

/// Writes one message and works out what else it needs fetched.
pub fn write_message(
    ctx: &RunContext,
    conn: &Connection,
    tally: &mut Tally,
    raw: &RawObject,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<MessageWrite> {
    let extracted = message_row(raw);
    for anomaly in &extracted.anomalies {
        tally.anomaly(anomaly);
    }
    tally.inc(Stat::MessagesSeen);
    let decision = resource::write(conn, &ctx.engine, &extracted.row, ctx.scheme_layer(), observed_at)?;
    if decision != Decision::Skip {
        tally.inc(Stat::MessagesSaved);
    }
    let derived = if decision != Decision::Skip || ctx.behaviour.recheck_media {
        derived_work(ctx, tally, raw.id, &extracted.facts)
    } else {
        Vec::new()
    };
    Ok(MessageWrite {
        decision,
        datetime: extracted.facts.datetime,
        derived,
    })
}

/// Stores an older copy of a message that is already held in a newer form.
pub fn write_earlier_message(
    ctx: &RunContext,
    conn: &Connection,
    tally: &mut Tally,
    raw: &RawObject,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<Vec<NewEntry>> {
    let extracted = message_row(raw);
    for anomaly in &extracted.anomalies {
        tally.anomaly(anomaly);
    }
    tally.inc(Stat::MessagesSeen);
    if !resource::insert_earlier_version(conn, &extracted.row, ctx.scheme_layer(), observed_at)? {
        return Ok(Vec::new());
    }
    tally.inc(Stat::MessagesSaved);
    Ok(derived_work(ctx, tally, raw.id, &extracted.facts))
}

/// Sender to the peer fetcher; a sticker to the sticker downloader;
/// otherwise each distinct media reference to the media downloader.
fn derived_work(ctx: &RunContext, tally: &mut Tally, message_id: i64, facts: &MessageFacts) -> Vec<NewEntry> {
    let mut work = Vec::new();
    if let Some(sender) = facts.sender {
        work.push(PeerWork { peer: sender }.entry(Some(message_id)));
    }
    if let Some(sticker) = &facts.sticker {
        work.push(
            StickerWork {
                sticker_id: sticker.sticker_id,
                sticker_set_id: sticker.sticker_set_id,
                file_ext: sticker.file_ext.clone(),
                document: None,
            }
            .entry(Some(message_id)),
        );
    } else if ctx.behaviour.download_media {
        let mut seen = HashSet::new();
        for media in &facts.media {
            if !seen.insert(media.media_id) {
                continue;
            }
            tally.inc(Stat::MediaSeen);
            work.push(MediaWork::from(media).entry(Some(message_id)));
        }
    }
    work
}

/// Flags messages as deleted, counting the ones that changed.
pub fn delete_messages(
    ctx: &RunContext,
    conn: &Connection,
    tally: &mut Tally,
    ids: &[i64],
    observed_at: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let changed = ChatDb::mark_deleted(conn, &ctx.engine, ids, observed_at)?;
    tally.add(Stat::MessagesDeleted, changed as u64);
    Ok(changed)
}
