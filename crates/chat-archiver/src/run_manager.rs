//! Drives one archive run through its phases.
//!
//! ```text
//! Queued -> HistoryBackfill -> LiveFollow -> Completed | Failed
//! ```
//!
//! Everything before the terminal states is re-entrant: a run that was
//! interrupted is picked up again with the same id, behaviour snapshot and
//! whatever its queue still holds.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

use crate::config::{BehaviourConfig, Config};
use crate::dedup::DedupEngine;
use crate::fetchers::{
    all_fetchers, run_worker, FatalReport, FetcherCaches, HistoryWork, LiveWork, PeerWork, RunContext, RunControl,
    Signal,
};
use crate::metrics;
use crate::protocol::{PeerRef, ProtocolClient};
use crate::queue::{NewEntry, Subsystem, SubsystemQueue};
use crate::run_record::{ArchiveRun, RunRecorder};
use crate::store::{with_transaction, ChatDb, CoreDb, StoreLayout};
use crate::target::{Target, TargetType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// Interrupted; the run stays incomplete and resumes next time.
    Aborted,
    /// Another run for the same target was already in progress.
    AlreadyActive,
}

impl RunOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Aborted => "aborted",
            RunOutcome::AlreadyActive => "already_active",
        }
    }
}

pub struct ArchiveRunManager {
    client: Arc<dyn ProtocolClient>,
    core: CoreDb,
    layout: StoreLayout,
    config: Config,
    caches: FetcherCaches,
    control: Arc<RunControl>,
    /// Bounds how many runs are in their history phase at once. Runs that
    /// moved on to live follow no longer hold a slot.
    backfill_slots: Arc<Semaphore>,
}

impl ArchiveRunManager {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        core: CoreDb,
        layout: StoreLayout,
        config: Config,
        control: Arc<RunControl>,
    ) -> Self {
        let backfill_slots = Arc::new(Semaphore::new(config.max_concurrent_targets.max(1)));
        Self {
            client,
            core,
            layout,
            config,
            caches: FetcherCaches::default(),
            control,
            backfill_slots,
        }
    }

    pub fn core(&self) -> &CoreDb {
        &self.core
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn control(&self) -> &Arc<RunControl> {
        &self.control
    }

    /// Returns the target's unfinished run if there is one, else queues a new
    /// run with `behaviour`.
    pub fn start_run(&self, target: Target, behaviour: BehaviourConfig) -> anyhow::Result<ArchiveRun> {
        if let Some(run) = self.core.latest_incomplete_run(&target)? {
            info!(
                "Resuming archive run {} for {} from {:?}",
                run.archive_run_id,
                target,
                run.phase()
            );
            return Ok(run);
        }
        let run = ArchiveRun::new(target, behaviour, Utc::now());
        self.core.insert_run(&run)?;
        Ok(run)
    }

    pub async fn archive(&self, target: Target, behaviour: BehaviourConfig) -> anyhow::Result<RunOutcome> {
        let run = self.start_run(target, behaviour)?;
        self.execute(run).await
    }

    /// Runs `run` until it completes, fails or is aborted.
    pub async fn execute(&self, run: ArchiveRun) -> anyhow::Result<RunOutcome> {
        let target = run.target;
        let slot = if run.history.end.is_none() {
            tokio::select! {
                permit = self.backfill_slots.clone().acquire_owned() => Some(permit?),
                _ = self.control.aborted() => {
                    info!("Archive run {} for {} aborted before it started", run.archive_run_id, target);
                    return Ok(RunOutcome::Aborted);
                }
            }
        } else {
            None
        };
        let chat_db = match ChatDb::open(&self.layout, target, self.config.db_pool_size) {
            Ok(db) => db,
            Err(e) => {
                let reason = format!("Failed to open store for {}: {:#}", target, e);
                error!("{}", reason);
                let mut failed = run;
                failed.completed = Some(false);
                failed.failure_reason = Some(reason.clone());
                self.core.save_run(&failed)?;
                metrics::inc_runs_finished("failed");
                return Ok(RunOutcome::Failed(reason));
            }
        };

        let time_queued = run.time_queued;
        let behaviour = run.behaviour.clone();
        let recorder = Arc::new(RunRecorder::new(
            run,
            self.core.clone(),
            Duration::from_secs(self.config.run_record_save_secs),
        ));
        let ctx = Arc::new(RunContext {
            client: self.client.clone(),
            queue: Arc::new(SubsystemQueue::new(chat_db.pool().clone())),
            chat_db,
            core_db: self.core.clone(),
            engine: DedupEngine::from_overlap_days(behaviour.msg_history_overlap_days),
            recorder: recorder.clone(),
            behaviour,
            layout: self.layout.clone(),
            config: self.config.clone(),
            caches: self.caches.clone(),
            control: self.control.clone(),
            shutdown: Signal::default(),
        });

        metrics::inc_active_runs();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let workers: Vec<_> = all_fetchers()
            .into_iter()
            .map(|fetcher| tokio::spawn(run_worker(fetcher, ctx.clone(), fatal_tx.clone())))
            .collect();
        drop(fatal_tx);

        let outcome = match self.supervise(&ctx, time_queued, slot, &mut fatal_rx).await {
            Ok(outcome) => outcome,
            Err(e) => RunOutcome::Failed(format!("{:#}", e)),
        };
        ctx.shutdown.raise();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Worker for {} ended abnormally: {}", target, e);
            }
        }
        self.report_depth(&ctx);

        match &outcome {
            RunOutcome::Completed => recorder.mark_complete()?,
            RunOutcome::Failed(reason) => recorder.mark_failed(reason)?,
            RunOutcome::Aborted | RunOutcome::AlreadyActive => recorder.save()?,
        }
        metrics::dec_active_runs();
        metrics::inc_runs_finished(outcome.status());
        info!("Archive run {} for {} finished: {}", recorder.run_id(), target, outcome.status());
        Ok(outcome)
    }

    async fn supervise(
        &self,
        ctx: &Arc<RunContext>,
        time_queued: DateTime<Utc>,
        slot: Option<OwnedSemaphorePermit>,
        fatal: &mut mpsc::UnboundedReceiver<FatalReport>,
    ) -> anyhow::Result<RunOutcome> {
        let snapshot = ctx.recorder.snapshot();
        let pending = ctx.queue.total_len()?;
        if snapshot.history.start.is_none() {
            // entries left by an earlier run are processed too, but never
            // stand in for this run's own seed
            if pending > 0 {
                info!("Found {} entries left by an earlier run of {}", pending, ctx.target());
            }
            self.seed(ctx, time_queued)?;
        } else if pending > 0 {
            info!("Resuming {} queued entries for {}", pending, ctx.target());
        }
        ctx.recorder.start_history()?;
        ctx.queue.notify_all();

        if snapshot.history.end.is_none() {
            if let Some(interrupted) = self
                .wait_for(ctx, fatal, false, || ctx.queue.is_drained(&Subsystem::BACKFILL))
                .await?
            {
                return Ok(interrupted);
            }
            ctx.recorder.end_history()?;
        }
        drop(slot);

        let following = ctx.behaviour.follow_live && !ctx.control.is_stopping();
        if following {
            if ctx.queue.len(Subsystem::Live)? == 0 {
                self.seed_follow(ctx)?;
            }
            ctx.recorder.start_follow()?;
            if let Some(interrupted) = self.wait_for(ctx, fatal, true, || Ok(false)).await? {
                return Ok(interrupted);
            }
            info!("Stopping live follow for {}", ctx.target());
        }

        if let Some(interrupted) = self.wait_for(ctx, fatal, false, || ctx.queue.is_empty()).await? {
            return Ok(interrupted);
        }
        if ctx.recorder.snapshot().follow.start.is_some() {
            ctx.recorder.end_follow()?;
        }
        Ok(RunOutcome::Completed)
    }

    /// Initial work for a fresh run: the target itself, its history and its
    /// admin log.
    fn seed(&self, ctx: &RunContext, time_queued: DateTime<Utc>) -> anyhow::Result<()> {
        let target = ctx.target();
        let dialog = self.core.dialog(target.target_id)?;
        let chat_type = dialog.as_ref().map(|d| d.chat_type.as_str());
        let peer = match (target.target_type, chat_type) {
            (TargetType::User, _) => PeerRef::user(target.target_id),
            (TargetType::Chat, Some("channel")) => PeerRef::channel(target.target_id),
            (TargetType::Chat, _) => PeerRef::chat(target.target_id),
        };

        let mut work: Vec<NewEntry> = vec![PeerWork { peer }.entry(None)];
        if ctx.behaviour.archive_history {
            work.push(HistoryWork::backfill(&ctx.chat_db, time_queued, ctx.behaviour.msg_history_overlap_days)?.entry());
        }
        // small chats have no admin log
        let has_admin_log = target.target_type == TargetType::Chat && chat_type != Some("chat");
        if ctx.behaviour.check_admin_log && has_admin_log {
            work.push(HistoryWork::AdminLog.entry());
        }
        with_transaction(ctx.chat_db.pool(), |tx| {
            for entry in &work {
                SubsystemQueue::enqueue_in(tx, entry)?;
            }
            Ok(())
        })?;
        info!("Seeded {} entries for {}", work.len(), target);
        Ok(())
    }

    /// Live follow starts with a catch-up walk down to the newest stored
    /// message, so nothing posted during the backfill is missed.
    fn seed_follow(&self, ctx: &RunContext) -> anyhow::Result<()> {
        let newest = ctx.chat_db.newest_message_id()?;
        with_transaction(ctx.chat_db.pool(), |tx| {
            SubsystemQueue::enqueue_in(tx, &HistoryWork::catch_up(newest).entry())?;
            SubsystemQueue::enqueue_in(tx, &LiveWork::default().entry())?;
            Ok(())
        })?;
        ctx.queue.notify_all();
        Ok(())
    }

    /// Waits until `done` holds (or, with `until_stop`, a stop is
    /// requested). Returns the outcome when the run is interrupted instead.
    async fn wait_for<F>(
        &self,
        ctx: &RunContext,
        fatal: &mut mpsc::UnboundedReceiver<FatalReport>,
        until_stop: bool,
        done: F,
    ) -> anyhow::Result<Option<RunOutcome>>
    where
        F: Fn() -> anyhow::Result<bool>,
    {
        let idle = Duration::from_millis(self.config.worker_idle_poll_ms);
        loop {
            if ctx.control.is_aborted() {
                return Ok(Some(RunOutcome::Aborted));
            }
            if let Ok(report) = fatal.try_recv() {
                return Ok(Some(RunOutcome::Failed(report.reason)));
            }
            if until_stop {
                if ctx.control.is_stopping() {
                    return Ok(None);
                }
            } else if done()? {
                return Ok(None);
            }
            self.report_depth(ctx);
            ctx.recorder.touch()?;
            tokio::select! {
                report = fatal.recv() => {
                    match report {
                        Some(report) => return Ok(Some(RunOutcome::Failed(report.reason))),
                        None => tokio::time::sleep(idle).await,
                    }
                }
                _ = tokio::time::sleep(idle) => {}
                _ = ctx.control.aborted() => {}
                _ = ctx.control.stopped(), if until_stop => {}
            }
        }
    }

    fn report_depth(&self, ctx: &RunContext) {
        let target = ctx.target().to_string();
        for subsystem in Subsystem::ALL {
            if let Ok(depth) = ctx.queue.len(subsystem) {
                metrics::set_queue_depth(&target, subsystem.as_str(), depth);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RawObject, ReplayClient, ReplayData};
    use crate::run_record::RunPhase;
    use serde_json::json;

    fn manager(dir: &std::path::Path, data: ReplayData) -> (Arc<ReplayClient>, ArchiveRunManager) {
        let layout = StoreLayout::new(dir);
        let core = CoreDb::open(&layout, 2).unwrap();
        let client = Arc::new(ReplayClient::new(data));
        let mut config = Config::default();
        config.worker_idle_poll_ms = 5;
        config.history_page_size = 2;
        let manager = ArchiveRunManager::new(client.clone(), core, layout, config, Arc::new(RunControl::new()));
        (client, manager)
    }

    fn data() -> ReplayData {
        let mut data = ReplayData::default();
        data.histories.insert(
            Target::chat(1),
            (1..=3)
                .map(|id| RawObject {
                    type_name: "Message".into(),
                    id,
                    str_repr: format!("Message(id={})", id),
                    dict: json!({"date": 1_700_000_000 + id, "from_id": {"user_id": 7}}),
                })
                .collect(),
        );
        data
    }

    #[tokio::test]
    async fn test_run_completes_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let (client, manager) = manager(dir.path(), data());
        let run = manager.start_run(Target::chat(1), BehaviourConfig::default()).unwrap();
        let outcome = manager.execute(run.clone()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let stored = manager.core().load_run(&run.archive_run_id).unwrap().unwrap();
        assert_eq!(stored.phase(), RunPhase::Completed);
        assert!(stored.history.end.is_some());
        assert_eq!(stored.stats.messages_saved, 3);
        assert_eq!(client.calls("full_peer"), 2);
        let chat = ChatDb::open(manager.layout(), Target::chat(1), 1).unwrap();
        assert_eq!(chat.message_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unfinished_run_is_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let (_client, manager) = manager(dir.path(), data());
        let first = manager.start_run(Target::chat(1), BehaviourConfig::default()).unwrap();
        let follow = BehaviourConfig { follow_live: true, ..BehaviourConfig::default() };
        let again = manager.start_run(Target::chat(1), follow).unwrap();
        assert_eq!(again.archive_run_id, first.archive_run_id);
        assert_eq!(again.behaviour, BehaviourConfig::default());
    }

    #[tokio::test]
    async fn test_fatal_error_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (client, manager) = manager(dir.path(), data());
        client.inject_failure("history_page", crate::error::ClientError::Fatal("banned".into()));
        let outcome = manager.archive(Target::chat(1), BehaviourConfig::default()).await.unwrap();
        let reason = match outcome {
            RunOutcome::Failed(reason) => reason,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert!(reason.contains("banned"));
        let runs = manager.core().runs_for_target(&Target::chat(1)).unwrap();
        assert_eq!(runs[0].completed, Some(false));
        assert!(runs[0].failure_reason.as_deref().unwrap().contains("banned"));
    }

    #[tokio::test]
    async fn test_malformed_responses_do_not_fail_the_run() {
        for op in ["history_page", "full_peer"] {
            let dir = tempfile::tempdir().unwrap();
            let (client, manager) = manager(dir.path(), data());
            client.inject_failure(op, crate::error::ClientError::Malformed("bad tl object".into()));
            let outcome = manager.archive(Target::chat(1), BehaviourConfig::default()).await.unwrap();
            assert_eq!(outcome, RunOutcome::Completed, "malformed {}", op);
            let run = &manager.core().runs_for_target(&Target::chat(1)).unwrap()[0];
            assert_eq!(run.stats.parse_anomalies, 1, "malformed {}", op);
        }
    }

    #[tokio::test]
    async fn test_fresh_run_seeds_despite_leftover_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (client, manager) = manager(dir.path(), data());
        {
            let chat = ChatDb::open(manager.layout(), Target::chat(1), 1).unwrap();
            let queue = SubsystemQueue::new(chat.pool().clone());
            queue.enqueue(&PeerWork { peer: PeerRef::user(7) }.entry(None)).unwrap();
        }
        let outcome = manager.archive(Target::chat(1), BehaviourConfig::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(client.calls("history_page") > 0);
        let chat = ChatDb::open(manager.layout(), Target::chat(1), 1).unwrap();
        assert_eq!(chat.message_count().unwrap(), 3);
        let run = &manager.core().runs_for_target(&Target::chat(1)).unwrap()[0];
        assert_eq!(run.stats.messages_saved, 3);
    }

    #[tokio::test]
    async fn test_following_runs_release_their_backfill_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = data();
        data.histories.insert(Target::chat(2), Vec::new());
        let layout = StoreLayout::new(dir.path());
        let core = CoreDb::open(&layout, 2).unwrap();
        let client = Arc::new(ReplayClient::new(data));
        let mut config = Config::default();
        config.worker_idle_poll_ms = 5;
        config.live_poll_ms = 5;
        config.max_concurrent_targets = 1;
        let manager = Arc::new(ArchiveRunManager::new(client, core, layout, config, Arc::new(RunControl::new())));
        let follow = BehaviourConfig { follow_live: true, ..BehaviourConfig::default() };

        let runs: Vec<_> = [Target::chat(1), Target::chat(2)]
            .into_iter()
            .map(|target| {
                let manager = manager.clone();
                let follow = follow.clone();
                tokio::spawn(async move { manager.archive(target, follow).await.unwrap() })
            })
            .collect();

        // with one slot, both runs only reach live follow if the first gives
        // its slot back when its backfill ends
        let following = |target: Target| {
            manager
                .core()
                .runs_for_target(&target)
                .unwrap()
                .first()
                .map_or(false, |run| run.follow.start.is_some())
        };
        tokio::time::timeout(Duration::from_secs(10), async {
            while !(following(Target::chat(1)) && following(Target::chat(2))) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both runs should be following at once");
        manager.control().request_stop();
        for run in runs {
            assert_eq!(run.await.unwrap(), RunOutcome::Completed);
        }
    }
}
