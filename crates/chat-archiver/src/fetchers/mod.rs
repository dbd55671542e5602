//! Resource fetchers and the worker loop that drives them.
//!
//! Each subsystem drains its own partition of the target's queue. A fetcher
//! does its network calls first and then commits everything it learned, the
//! work it derived and the ack of its entry in one transaction on the target
//! store, so a crash at any point leaves either the old entry or its results.

pub mod history;
pub mod live;
pub mod media;
pub mod messages;
pub mod peer;
pub mod sticker;

pub use history::{HistoryFetcher, HistoryWork};
pub use live::{LiveFollower, LiveWork};
pub use media::{MediaDownloader, MediaWork};
pub use peer::{PeerDataFetcher, PeerWork};
pub use sticker::{StickerDownloader, StickerWork};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use moka::sync::Cache;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::config::{BehaviourConfig, Config};
use crate::dedup::DedupEngine;
use crate::error::{ArchiveError, ClientError};
use crate::metrics;
use crate::protocol::ProtocolClient;
use crate::queue::{NewEntry, QueueEntry, Subsystem, SubsystemQueue};
use crate::run_record::{RunRecorder, Stat};
use crate::store::{with_transaction, ChatDb, CoreDb, StoreLayout};
use crate::target::Target;

/// A one-way flag that async code can wait on.
#[derive(Debug, Default)]
pub struct Signal {
    raised: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn raise(&self) {
        if !self.raised.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub async fn raised(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

/// Operator requests shared by every run of a process.
///
/// A stop lets runs finish the work they hold and stops live following. An
/// abort leaves at the next queue item, keeping runs resumable.
#[derive(Debug, Default)]
pub struct RunControl {
    stop: Signal,
    abort: Signal,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        info!("Stop requested");
        self.stop.raise();
    }

    pub fn request_abort(&self) {
        warn!("Abort requested");
        self.abort.raise();
        self.stop.raise();
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_raised()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_raised()
    }

    pub async fn stopped(&self) {
        self.stop.raised().await
    }

    pub async fn aborted(&self) {
        self.abort.raised().await
    }
}

/// "Seen recently" caches that outlive a single run.
#[derive(Clone)]
pub struct FetcherCaches {
    pub sticker_sets: Cache<i64, ()>,
    pub core_peers: Cache<String, ()>,
    pub target_peers: Cache<String, ()>,
}

impl FetcherCaches {
    pub fn new(ttl: Duration) -> Self {
        fn build<K>(capacity: u64, ttl: Duration) -> Cache<K, ()>
        where
            K: std::hash::Hash + Eq + Send + Sync + 'static,
        {
            Cache::builder().max_capacity(capacity).time_to_live(ttl).build()
        }
        Self {
            sticker_sets: build(10_000, ttl),
            core_peers: build(100_000, ttl),
            target_peers: build(100_000, ttl),
        }
    }
}

impl Default for FetcherCaches {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

/// Everything a fetcher may touch while serving one run.
pub struct RunContext {
    pub client: Arc<dyn ProtocolClient>,
    pub chat_db: ChatDb,
    pub core_db: CoreDb,
    pub queue: Arc<SubsystemQueue>,
    pub engine: DedupEngine,
    pub recorder: Arc<RunRecorder>,
    pub behaviour: BehaviourConfig,
    pub layout: StoreLayout,
    pub config: Config,
    pub caches: FetcherCaches,
    pub control: Arc<RunControl>,
    /// Raised by the run manager once the run no longer needs its workers.
    pub shutdown: Signal,
}

impl RunContext {
    pub fn target(&self) -> Target {
        self.chat_db.target()
    }

    pub fn scheme_layer(&self) -> i32 {
        self.client.scheme_layer()
    }

    pub fn count(&self, stat: Stat) {
        self.recorder.stats().inc(stat);
    }

    pub fn anomaly(&self, what: &str) {
        warn!("Parse anomaly in {}: {}", self.target(), what);
        self.recorder.stats().inc(Stat::ParseAnomalies);
    }

    /// A malformed response is a data error: it is recorded as an anomaly
    /// and the caller skips the item. Any other error is handed back.
    pub fn tolerate_malformed(&self, what: &str, err: ClientError) -> anyhow::Result<()> {
        match err {
            ClientError::Malformed(reason) => {
                self.anomaly(&format!("{}: {}", what, reason));
                Ok(())
            }
            other => Err(other.into()),
        }
    }

    /// Runs `f` in one transaction together with enqueueing the work it
    /// returns and acking `entry`. Whatever `f` counts in the tally is
    /// applied only once the transaction has committed.
    pub fn commit<F>(&self, entry: &QueueEntry, f: F) -> anyhow::Result<ProcessOutcome>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &mut Tally) -> anyhow::Result<Vec<NewEntry>>,
    {
        let mut tally = Tally::default();
        let derived = with_transaction(self.chat_db.pool(), |tx| {
            let derived = f(tx, &mut tally)?;
            for work in &derived {
                SubsystemQueue::enqueue_in(tx, work)?;
            }
            SubsystemQueue::ack_in(tx, entry.queue_entry_id)?;
            Ok(derived)
        })?;
        tally.apply(self);
        Ok(ProcessOutcome { derived, committed: true })
    }
}

/// Counters staged while a transaction is open.
#[derive(Debug, Default)]
pub struct Tally {
    counts: Vec<(Stat, u64)>,
}

impl Tally {
    pub fn add(&mut self, stat: Stat, n: u64) {
        if n > 0 {
            self.counts.push((stat, n));
        }
    }

    pub fn inc(&mut self, stat: Stat) {
        self.add(stat, 1);
    }

    pub fn anomaly(&mut self, what: &str) {
        warn!("Parse anomaly: {}", what);
        self.inc(Stat::ParseAnomalies);
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counts.iter().filter(|(s, _)| *s == stat).map(|(_, n)| n).sum()
    }

    /// Moves the staged counts into the run stats and the metrics.
    pub fn apply(self, ctx: &RunContext) {
        for (stat, n) in self.counts {
            ctx.recorder.stats().add(stat, n);
            match stat {
                Stat::MessagesSaved => metrics::inc_messages(n),
                Stat::MessagesDeleted => metrics::inc_messages_deleted(n),
                Stat::AdminEventsSaved => metrics::inc_admin_events(n),
                _ => {}
            }
        }
    }
}

/// Result of processing one queue entry.
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    pub derived: Vec<NewEntry>,
    /// False when the entry was left in the queue untouched.
    pub committed: bool,
}

impl ProcessOutcome {
    pub fn deferred() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    fn subsystem(&self) -> Subsystem;

    async fn process(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome>;
}

/// Reads a typed payload out of an entry's extra data.
pub fn decode_work<T: serde::de::DeserializeOwned>(entry: &QueueEntry) -> anyhow::Result<T> {
    serde_json::from_value(entry.extra_data.clone()).map_err(|e| {
        ArchiveError::InvalidQueueEntry {
            entry_id: entry.queue_entry_id,
            reason: e.to_string(),
        }
        .into()
    })
}

/// Writes through a temporary sibling and a rename, so whatever sits at
/// `path` is always a complete file.
pub async fn write_file_atomically(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// A failure that ends the run.
#[derive(Debug, Clone)]
pub struct FatalReport {
    pub subsystem: Subsystem,
    pub reason: String,
}

pub fn all_fetchers() -> Vec<Arc<dyn ResourceFetcher>> {
    vec![
        Arc::new(HistoryFetcher),
        Arc::new(LiveFollower),
        Arc::new(MediaDownloader),
        Arc::new(StickerDownloader),
        Arc::new(PeerDataFetcher),
    ]
}

/// Drains one subsystem's entries until the run shuts down, an abort is
/// requested, or a fatal error is reported.
pub async fn run_worker(
    fetcher: Arc<dyn ResourceFetcher>,
    ctx: Arc<RunContext>,
    fatal: mpsc::UnboundedSender<FatalReport>,
) {
    let subsystem = fetcher.subsystem();
    let waker = ctx.queue.waker(subsystem);
    let idle = Duration::from_millis(ctx.config.worker_idle_poll_ms);
    debug!("{} worker started for {}", subsystem, ctx.target());

    loop {
        if ctx.control.is_aborted() || ctx.shutdown.is_raised() {
            break;
        }
        let entry = match ctx.queue.dequeue(subsystem) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                tokio::select! {
                    _ = waker.notified() => {}
                    _ = tokio::time::sleep(idle) => {}
                    _ = ctx.shutdown.raised() => {}
                    _ = ctx.control.aborted() => {}
                }
                continue;
            }
            Err(e) => {
                let _ = fatal.send(FatalReport { subsystem, reason: format!("{:#}", e) });
                break;
            }
        };

        let started = Instant::now();
        let what = format!("{} entry {}", subsystem, entry.queue_entry_id);
        let result = ctx
            .config
            .retry
            .run(&what, || fetcher.process(&ctx, &entry))
            .await;
        ctx.queue.release(entry.queue_entry_id);
        metrics::observe_fetch(subsystem.as_str(), started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                if !outcome.committed {
                    debug!("{} left in the queue", what);
                    continue;
                }
                for work in &outcome.derived {
                    ctx.queue.notify(work.subsystem);
                }
                if let Err(e) = ctx.recorder.touch() {
                    warn!("Failed to save run progress: {:#}", e);
                }
            }
            Err(e) => {
                error!("{} failed for {}: {:#}", what, ctx.target(), e);
                let _ = fatal.send(FatalReport {
                    subsystem,
                    reason: format!("{}: {:#}", what, e),
                });
                break;
            }
        }
    }
    debug!("{} worker stopped for {}", subsystem, ctx.target());
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::protocol::{RawObject, ReplayClient, ReplayData};
    use crate::run_record::ArchiveRun;
    use chrono::Utc;

    pub struct Harness {
        pub _dir: tempfile::TempDir,
        pub client: Arc<ReplayClient>,
        pub ctx: Arc<RunContext>,
    }

    pub fn message(id: i64, date: i64, dict: serde_json::Value) -> RawObject {
        let mut dict = dict;
        if let Some(map) = dict.as_object_mut() {
            map.insert("date".into(), serde_json::json!(date));
        }
        RawObject {
            type_name: "Message".into(),
            id,
            str_repr: format!("Message(id={}, {})", id, dict),
            dict,
        }
    }

    pub fn harness(data: ReplayData, behaviour: BehaviourConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        let target = Target::chat(1);
        let core_db = CoreDb::open(&layout, 2).unwrap();
        let chat_db = ChatDb::open(&layout, target, 2).unwrap();
        let run = ArchiveRun::new(target, behaviour.clone(), Utc::now());
        core_db.insert_run(&run).unwrap();
        let recorder = Arc::new(RunRecorder::new(run, core_db.clone(), Duration::from_secs(60)));
        let client = Arc::new(ReplayClient::new(data));
        let mut config = Config::default();
        config.history_page_size = 2;
        config.live_poll_ms = 1;
        let ctx = RunContext {
            client: client.clone(),
            queue: Arc::new(SubsystemQueue::new(chat_db.pool().clone())),
            chat_db,
            core_db,
            engine: DedupEngine::from_overlap_days(behaviour.msg_history_overlap_days),
            recorder,
            behaviour,
            layout,
            config,
            caches: FetcherCaches::default(),
            control: Arc::new(RunControl::new()),
            shutdown: Signal::default(),
        };
        Harness { _dir: dir, client, ctx: Arc::new(ctx) }
    }

    /// Processes every entry of `subsystem` until its partition is empty.
    pub async fn drain(ctx: &RunContext, fetcher: &dyn ResourceFetcher) -> usize {
        let mut processed = 0;
        while let Some(entry) = ctx.queue.dequeue(fetcher.subsystem()).unwrap() {
            fetcher.process(ctx, &entry).await.unwrap();
            ctx.queue.release(entry.queue_entry_id);
            processed += 1;
        }
        processed
    }
}
