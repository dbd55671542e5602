//! Peer data fetcher: users, small chats and channels.
//!
//! A peer is written twice, once to the shared core store and once to the
//! target store. Either write is skipped for a day after it last happened.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{decode_work, ProcessOutcome, ResourceFetcher, RunContext};
use crate::metrics;
use crate::protocol::{PeerRef, PeerType};
use crate::queue::{NewEntry, QueueEntry, Subsystem};
use crate::run_record::Stat;
use crate::store::resource;
use crate::store::schema::{chat_row, user_row};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerWork {
    pub peer: PeerRef,
}

impl PeerWork {
    pub fn entry(&self, message_id: Option<i64>) -> NewEntry {
        NewEntry::new(
            Subsystem::Peer,
            message_id,
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }
}

pub struct PeerDataFetcher;

#[async_trait]
impl ResourceFetcher for PeerDataFetcher {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Peer
    }

    async fn process(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome> {
        let work: PeerWork = decode_work(entry)?;
        let core_key = work.peer.cache_key();
        let target_key = format!("{}/{}", ctx.target(), core_key);
        let core_fresh = ctx.caches.core_peers.contains_key(&core_key);
        let target_fresh = ctx.caches.target_peers.contains_key(&target_key);
        if core_fresh && target_fresh {
            debug!("Peer {} seen recently, skipping", core_key);
            return ctx.commit(entry, |_, _| Ok(Vec::new()));
        }

        let raw = match ctx.client.full_peer(&work.peer).await {
            Ok(raw) => raw,
            Err(e) => {
                ctx.tolerate_malformed(&format!("peer {}", core_key), e)?;
                return ctx.commit(entry, |_, _| Ok(Vec::new()));
            }
        };
        ctx.count(Stat::PeersFetched);
        metrics::inc_peers();

        let (row, related, anomalies) = match work.peer.peer_type {
            PeerType::User => {
                let extracted = user_row(&raw);
                (extracted.row, Vec::new(), extracted.anomalies)
            }
            PeerType::Chat | PeerType::Channel => {
                let extracted = chat_row(&raw);
                (extracted.row, extracted.facts, extracted.anomalies)
            }
        };
        for anomaly in &anomalies {
            ctx.anomaly(anomaly);
        }

        let layer = ctx.scheme_layer();
        let observed_at = Utc::now();
        if !core_fresh {
            ctx.core_db.write_resource(&ctx.engine, &row, layer, observed_at)?;
        }
        let outcome = ctx.commit(entry, |tx, _| {
            if !target_fresh {
                resource::write(tx, &ctx.engine, &row, layer, observed_at)?;
            }
            Ok(related
                .iter()
                .filter(|peer| **peer != work.peer)
                .map(|peer| PeerWork { peer: *peer }.entry(entry.message_id))
                .collect())
        })?;
        ctx.caches.core_peers.insert(core_key, ());
        ctx.caches.target_peers.insert(target_key, ());
        Ok(outcome)
    }
}
