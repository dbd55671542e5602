//! Archive run records: per-phase timers, counters and their persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BehaviourConfig;
use crate::store::CoreDb;
use crate::target::Target;

/// Start, latest and end of one phase of a run.
///
/// `latest` never moves backwards and never passes `end`; once `end` is set
/// the timer is frozen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTimer {
    pub start: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl RunTimer {
    pub fn is_running(&self) -> bool {
        self.start.is_some() && self.end.is_none()
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        if self.start.is_none() {
            self.start = Some(at);
        }
        self.touch(at);
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if self.end.is_some() {
            return;
        }
        let start = *self.start.get_or_insert(at);
        let at = at.max(start);
        self.latest = Some(self.latest.map_or(at, |latest| latest.max(at)));
    }

    pub fn end(&mut self, at: DateTime<Utc>) {
        if self.end.is_some() {
            return;
        }
        self.touch(at);
        let end = self.latest.unwrap_or(at);
        self.end = Some(end);
    }

    /// Combines phase timers into the overall run timer: earliest start,
    /// latest end (only once every started phase has ended), and the latest
    /// `latest` clamped into that range.
    pub fn merge(timers: &[RunTimer]) -> RunTimer {
        let start = timers.iter().filter_map(|t| t.start).min();
        let all_ended = timers.iter().all(|t| t.start.is_none() || t.end.is_some());
        let end = if all_ended { timers.iter().filter_map(|t| t.end).max() } else { None };
        let mut latest = timers.iter().filter_map(|t| t.latest).max();
        if let (Some(l), Some(e)) = (latest, end) {
            latest = Some(l.min(e));
        }
        if let Some(s) = start {
            latest = Some(latest.map_or(s, |l| l.max(s)));
        }
        RunTimer { start, latest, end }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Queued,
    HistoryBackfill,
    LiveFollow,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    MessagesSeen,
    MessagesSaved,
    MessagesDeleted,
    AdminEventsSeen,
    AdminEventsSaved,
    MediaSeen,
    MediaDownloaded,
    StickersDownloaded,
    PeersFetched,
    ParseAnomalies,
}

const STAT_COUNT: usize = 10;

/// Persisted form of the run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveStatsSnapshot {
    pub messages_seen: u64,
    pub messages_saved: u64,
    pub messages_deleted: u64,
    pub admin_events_seen: u64,
    pub admin_events_saved: u64,
    pub media_seen: u64,
    pub media_downloaded: u64,
    pub stickers_downloaded: u64,
    pub peers_fetched: u64,
    pub parse_anomalies: u64,
}

/// Counters shared by every worker of a run.
#[derive(Debug, Default)]
pub struct ArchiveStats {
    counters: [AtomicU64; STAT_COUNT],
}

impl ArchiveStats {
    pub fn from_snapshot(snapshot: &ArchiveStatsSnapshot) -> Self {
        let stats = Self::default();
        let values = [
            snapshot.messages_seen,
            snapshot.messages_saved,
            snapshot.messages_deleted,
            snapshot.admin_events_seen,
            snapshot.admin_events_saved,
            snapshot.media_seen,
            snapshot.media_downloaded,
            snapshot.stickers_downloaded,
            snapshot.peers_fetched,
            snapshot.parse_anomalies,
        ];
        for (counter, value) in stats.counters.iter().zip(values) {
            counter.store(value, Ordering::Relaxed);
        }
        stats
    }

    pub fn add(&self, stat: Stat, n: u64) {
        self.counters[stat as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self, stat: Stat) {
        self.add(stat, 1);
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ArchiveStatsSnapshot {
        ArchiveStatsSnapshot {
            messages_seen: self.get(Stat::MessagesSeen),
            messages_saved: self.get(Stat::MessagesSaved),
            messages_deleted: self.get(Stat::MessagesDeleted),
            admin_events_seen: self.get(Stat::AdminEventsSeen),
            admin_events_saved: self.get(Stat::AdminEventsSaved),
            media_seen: self.get(Stat::MediaSeen),
            media_downloaded: self.get(Stat::MediaDownloaded),
            stickers_downloaded: self.get(Stat::StickersDownloaded),
            peers_fetched: self.get(Stat::PeersFetched),
            parse_anomalies: self.get(Stat::ParseAnomalies),
        }
    }
}

/// One invocation of the archiver against one target.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRun {
    pub archive_run_id: String,
    pub target: Target,
    pub time_queued: DateTime<Utc>,
    pub history: RunTimer,
    pub follow: RunTimer,
    pub behaviour: BehaviourConfig,
    pub completed: Option<bool>,
    pub failure_reason: Option<String>,
    pub stats: ArchiveStatsSnapshot,
}

impl ArchiveRun {
    pub fn new(target: Target, behaviour: BehaviourConfig, time_queued: DateTime<Utc>) -> Self {
        Self {
            archive_run_id: Uuid::new_v4().to_string(),
            target,
            time_queued,
            history: RunTimer::default(),
            follow: RunTimer::default(),
            behaviour,
            completed: None,
            failure_reason: None,
            stats: ArchiveStatsSnapshot::default(),
        }
    }

    pub fn run_times(&self) -> RunTimer {
        RunTimer::merge(&[self.history, self.follow])
    }

    pub fn is_finished(&self) -> bool {
        self.completed.is_some()
    }

    pub fn phase(&self) -> RunPhase {
        match self.completed {
            Some(true) => RunPhase::Completed,
            Some(false) => RunPhase::Failed,
            None if self.follow.start.is_some() => RunPhase::LiveFollow,
            None if self.history.start.is_some() => RunPhase::HistoryBackfill,
            None => RunPhase::Queued,
        }
    }
}

/// Tracks an active run and writes it to the core database, at most once per
/// save interval unless forced.
pub struct RunRecorder {
    run: Mutex<ArchiveRun>,
    stats: Arc<ArchiveStats>,
    core: CoreDb,
    save_interval: Duration,
    last_save: Mutex<Option<Instant>>,
}

impl RunRecorder {
    pub fn new(run: ArchiveRun, core: CoreDb, save_interval: Duration) -> Self {
        let stats = Arc::new(ArchiveStats::from_snapshot(&run.stats));
        Self {
            run: Mutex::new(run),
            stats,
            core,
            save_interval,
            last_save: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArchiveRun> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> &Arc<ArchiveStats> {
        &self.stats
    }

    pub fn run_id(&self) -> String {
        self.lock().archive_run_id.clone()
    }

    pub fn behaviour(&self) -> BehaviourConfig {
        self.lock().behaviour.clone()
    }

    pub fn snapshot(&self) -> ArchiveRun {
        let mut run = self.lock().clone();
        run.stats = self.stats.snapshot();
        run
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().phase()
    }

    fn update(&self, f: impl FnOnce(&mut ArchiveRun)) -> anyhow::Result<()> {
        {
            let mut run = self.lock();
            f(&mut *run);
        }
        self.maybe_save()
    }

    pub fn start_history(&self) -> anyhow::Result<()> {
        info!("History backfill started for run {}", self.run_id());
        self.update(|run| run.history.start(Utc::now()))?;
        self.save()
    }

    pub fn end_history(&self) -> anyhow::Result<()> {
        info!("History backfill finished for run {}", self.run_id());
        self.update(|run| run.history.end(Utc::now()))?;
        self.save()
    }

    pub fn start_follow(&self) -> anyhow::Result<()> {
        info!("Live follow started for run {}", self.run_id());
        self.update(|run| run.follow.start(Utc::now()))?;
        self.save()
    }

    pub fn end_follow(&self) -> anyhow::Result<()> {
        self.update(|run| run.follow.end(Utc::now()))?;
        self.save()
    }

    /// Advances whichever phase is running.
    pub fn touch(&self) -> anyhow::Result<()> {
        self.update(|run| {
            let now = Utc::now();
            if run.follow.is_running() {
                run.follow.touch(now);
            } else if run.history.is_running() {
                run.history.touch(now);
            }
        })
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let run = self.snapshot();
        self.core.save_run(&run)?;
        *self.last_save.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        debug!("Saved run record {}", run.archive_run_id);
        Ok(())
    }

    pub fn maybe_save(&self) -> anyhow::Result<()> {
        let due = self
            .last_save
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map_or(true, |last| last.elapsed() >= self.save_interval);
        if due {
            self.save()?;
        }
        Ok(())
    }

    pub fn mark_complete(&self) -> anyhow::Result<()> {
        self.finish(true, None)
    }

    pub fn mark_failed(&self, reason: &str) -> anyhow::Result<()> {
        warn!("Run {} failed: {}", self.run_id(), reason);
        self.finish(false, Some(reason.to_string()))
    }

    fn finish(&self, success: bool, reason: Option<String>) -> anyhow::Result<()> {
        {
            let mut run = self.lock();
            let now = Utc::now();
            if run.history.is_running() {
                run.history.end(now);
            }
            if run.follow.is_running() {
                run.follow.end(now);
            }
            run.completed = Some(success);
            run.failure_reason = reason;
        }
        self.save()
    }
}
