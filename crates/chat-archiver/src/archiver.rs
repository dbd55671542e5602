//! Top-level entry point: refreshes the dialog list, picks the targets to
//! archive and runs them, with a bounded number backfilling at once.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::config::{ArchiveSettings, Config};
use crate::dedup::DedupEngine;
use crate::fetchers::RunControl;
use crate::protocol::ProtocolClient;
use crate::run_manager::{ArchiveRunManager, RunOutcome};
use crate::run_record::ArchiveRun;
use crate::store::core_db::Dialog;
use crate::store::{CoreDb, StoreLayout};
use crate::target::Target;

pub struct Archiver {
    client: Arc<dyn ProtocolClient>,
    manager: ArchiveRunManager,
    settings: ArchiveSettings,
    config: Config,
    /// Target -> id of the run currently executing for it.
    active: DashMap<Target, String>,
}

impl Archiver {
    pub fn open(
        client: Arc<dyn ProtocolClient>,
        config: Config,
        settings: ArchiveSettings,
        control: Arc<RunControl>,
    ) -> anyhow::Result<Self> {
        let layout = StoreLayout::new(&config.store_root);
        let core = CoreDb::open(&layout, config.db_pool_size)?;
        let manager = ArchiveRunManager::new(client.clone(), core, layout, config.clone(), control);
        Ok(Self {
            client,
            manager,
            settings,
            config,
            active: DashMap::new(),
        })
    }

    pub fn manager(&self) -> &ArchiveRunManager {
        &self.manager
    }

    pub fn is_active(&self, target: &Target) -> bool {
        self.active.contains_key(target)
    }

    /// Stores the account's current dialog list and returns every known
    /// target.
    pub async fn sync_dialogs(&self) -> anyhow::Result<Vec<Target>> {
        let client = self.client.clone();
        let listed = self
            .config
            .retry
            .run("list_dialogs", || {
                let client = client.clone();
                async move { Ok(client.list_dialogs().await?) }
            })
            .await?;

        // dialogs are current-state rows, the recheck window does not apply
        let engine = DedupEngine::new(None);
        let layer = self.client.scheme_layer();
        let seen_at = Utc::now();
        for raw in &listed.dialogs {
            self.manager
                .core()
                .upsert_dialog(&engine, raw, layer, listed.used_takeout, seen_at)?;
        }
        info!(
            "Synced {} dialogs{}",
            listed.dialogs.len(),
            if listed.used_takeout { " (takeout session)" } else { "" }
        );

        Ok(self.manager.core().dialogs()?.iter().map(Dialog::target).collect())
    }

    /// Archives `only`, or every target the settings select. Returns one
    /// outcome per target.
    pub async fn run(&self, only: Option<Target>) -> anyhow::Result<Vec<(Target, RunOutcome)>> {
        let known = self.sync_dialogs().await?;
        let targets = match only {
            Some(target) => vec![target],
            None => self.settings.targets_to_archive(&known),
        };
        if targets.is_empty() {
            warn!("No targets selected for archiving");
            return Ok(Vec::new());
        }

        // every run is queued (and its time_queued persisted) before any starts
        let mut runs = Vec::with_capacity(targets.len());
        for target in targets {
            let behaviour = self.settings.behaviour_for(&target);
            runs.push(self.manager.start_run(target, behaviour)?);
        }
        info!(
            "Archiving {} targets, backfilling at most {} at a time",
            runs.len(),
            self.config.max_concurrent_targets
        );

        // every run starts; the manager holds each one back until a backfill
        // slot frees up, and live-following runs do not occupy one
        let outcomes = join_all(runs.into_iter().map(|run| self.execute(run))).await;
        Ok(outcomes)
    }

    async fn execute(&self, run: ArchiveRun) -> (Target, RunOutcome) {
        let target = run.target;
        match self.active.entry(target) {
            Entry::Occupied(existing) => {
                warn!("Run {} is already active for {}", existing.get(), target);
                return (target, RunOutcome::AlreadyActive);
            }
            Entry::Vacant(slot) => {
                slot.insert(run.archive_run_id.clone());
            }
        }

        let outcome = match self.manager.execute(run).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Archive run for {} could not be recorded: {:#}", target, e);
                RunOutcome::Failed(format!("{:#}", e))
            }
        };
        self.active.remove(&target);
        (target, outcome)
    }
}
