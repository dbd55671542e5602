//! Live follower. A single entry carries the event cursor and re-queues
//! itself after every poll until a stop is requested.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::messages::{delete_messages, write_message};
use super::{decode_work, ProcessOutcome, ResourceFetcher, RunContext};
use crate::protocol::LiveEvent;
use crate::queue::{NewEntry, QueueEntry, Subsystem};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveWork {
    #[serde(default)]
    pub cursor: u64,
    /// The previous poll returned nothing; wait before polling again.
    #[serde(default)]
    pub idle: bool,
}

impl LiveWork {
    pub fn entry(&self) -> NewEntry {
        NewEntry::new(
            Subsystem::Live,
            None,
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }
}

pub struct LiveFollower;

#[async_trait]
impl ResourceFetcher for LiveFollower {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Live
    }

    async fn process(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome> {
        let work: LiveWork = decode_work(entry)?;
        if work.idle && !ctx.control.is_stopping() {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ctx.config.live_poll_ms)) => {}
                _ = ctx.control.stopped() => {}
                _ = ctx.shutdown.raised() => {}
            }
        }
        if ctx.control.is_aborted() {
            return Ok(ProcessOutcome::deferred());
        }

        // decided before polling so a stop that lands mid-poll still gets a final poll
        let final_poll = ctx.control.is_stopping() || !ctx.behaviour.follow_live;
        let batch = match ctx.client.poll_live_events(&ctx.target(), work.cursor).await {
            Ok(batch) => batch,
            Err(e) => {
                ctx.tolerate_malformed("live events", e)?;
                // poll again from the same cursor after the idle wait
                let retry = LiveWork { cursor: work.cursor, idle: true };
                return ctx.commit(entry, |_, _| Ok(if final_poll { Vec::new() } else { vec![retry.entry()] }));
            }
        };
        if !batch.events.is_empty() {
            debug!("{} live events for {}", batch.events.len(), ctx.target());
        }
        let observed_at = Utc::now();
        ctx.commit(entry, |tx, tally| {
            let mut derived = Vec::new();
            for event in &batch.events {
                match event {
                    LiveEvent::NewMessage { message } | LiveEvent::EditedMessage { message } => {
                        derived.extend(write_message(ctx, tx, tally, message, observed_at)?.derived);
                    }
                    LiveEvent::DeletedMessages { ids } => {
                        delete_messages(ctx, tx, tally, ids, observed_at)?;
                    }
                }
            }
            if !final_poll {
                derived.push(
                    LiveWork {
                        cursor: batch.cursor,
                        idle: batch.events.is_empty(),
                    }
                    .entry(),
                );
            }
            Ok(derived)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BehaviourConfig;
    use crate::error::ClientError;
    use crate::fetchers::test_support::{harness, message};
    use crate::protocol::ReplayData;
    use crate::run_record::Stat;
    use crate::store::schema::ResourceKind;
    use crate::target::Target;
    use serde_json::json;

    fn following() -> BehaviourConfig {
        BehaviourConfig { follow_live: true, ..BehaviourConfig::default() }
    }

    fn stored_flags(h: &crate::fetchers::test_support::Harness, id: i64) -> (bool, Option<String>) {
        let conn = h.ctx.chat_db.conn().unwrap();
        conn.query_row(
            "SELECT deleted, edit_datetime FROM messages WHERE id = ?1 ORDER BY archive_datetime DESC LIMIT 1",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap()
    }

    async fn step(h: &crate::fetchers::test_support::Harness) -> ProcessOutcome {
        let entry = h.ctx.queue.dequeue(Subsystem::Live).unwrap().unwrap();
        let outcome = LiveFollower.process(&h.ctx, &entry).await.unwrap();
        h.ctx.queue.release(entry.queue_entry_id);
        outcome
    }

    #[tokio::test]
    async fn test_events_apply_and_cursor_advances() {
        let h = harness(ReplayData::default(), following());
        let target = Target::chat(1);
        h.client.push_live_event(target, LiveEvent::NewMessage { message: message(1, 1_700_000_000, json!({})) });
        h.client.push_live_event(target, LiveEvent::NewMessage { message: message(2, 1_700_000_010, json!({})) });
        h.client.push_live_event(
            target,
            LiveEvent::EditedMessage { message: message(1, 1_700_000_000, json!({"message": "fixed", "edit_date": 1_700_000_100})) },
        );
        h.client.push_live_event(target, LiveEvent::DeletedMessages { ids: vec![2] });
        h.ctx.queue.enqueue(&LiveWork::default().entry()).unwrap();

        step(&h).await;
        let next = h.ctx.queue.pending().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].extra_data, json!({"cursor": 4, "idle": false}));

        assert_eq!(h.ctx.chat_db.version_count(ResourceKind::Message, 1).unwrap(), 1);
        let (deleted, edited) = stored_flags(&h, 1);
        assert!(!deleted);
        assert!(edited.is_some());
        assert!(stored_flags(&h, 2).0);
    }

    #[tokio::test]
    async fn test_stop_does_a_final_poll() {
        let h = harness(ReplayData::default(), following());
        h.ctx.queue.enqueue(&LiveWork { cursor: 0, idle: true }.entry()).unwrap();
        h.ctx.control.request_stop();
        h.client.push_live_event(Target::chat(1), LiveEvent::NewMessage { message: message(3, 1_700_000_000, json!({})) });
        let outcome = step(&h).await;
        assert!(outcome.committed);
        assert!(h.ctx.queue.is_empty().unwrap());
        assert_eq!(h.ctx.chat_db.message_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abort_leaves_entry_in_place() {
        let h = harness(ReplayData::default(), following());
        h.ctx.queue.enqueue(&LiveWork::default().entry()).unwrap();
        h.ctx.control.request_abort();
        let outcome = step(&h).await;
        assert!(!outcome.committed);
        assert_eq!(h.ctx.queue.len(Subsystem::Live).unwrap(), 1);
        assert_eq!(h.client.calls("poll_live_events"), 0);
    }

    #[tokio::test]
    async fn test_malformed_poll_keeps_cursor() {
        let h = harness(ReplayData::default(), following());
        h.ctx.queue.enqueue(&LiveWork { cursor: 7, idle: false }.entry()).unwrap();
        h.client.inject_failure("poll_live_events", ClientError::Malformed("bad update".into()));
        let outcome = step(&h).await;
        assert!(outcome.committed);
        let next = h.ctx.queue.pending().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].extra_data, json!({"cursor": 7, "idle": true}));
        assert_eq!(h.ctx.recorder.stats().get(Stat::ParseAnomalies), 1);
    }

    #[tokio::test]
    async fn test_unreachable_service_fails_the_poll() {
        let h = harness(ReplayData::default(), following());
        h.ctx.queue.enqueue(&LiveWork::default().entry()).unwrap();
        h.client.inject_failure("poll_live_events", ClientError::PermissionDenied("banned".into()));
        let entry = h.ctx.queue.dequeue(Subsystem::Live).unwrap().unwrap();
        assert!(LiveFollower.process(&h.ctx, &entry).await.is_err());
    }
}
