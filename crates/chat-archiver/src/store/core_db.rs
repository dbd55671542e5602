//! The shared core database: archive runs, dialogs, global peers and stickers.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::schema::{ResourceRow, CORE_MIGRATIONS};
use super::{format_ts, get_conn, open_pool, parse_opt_ts, parse_ts, resource, with_transaction, DbPool, StoreLayout};
use crate::config::BehaviourConfig;
use crate::dedup::{Decision, DedupEngine, LastSeen, Observation, WritePolicy};
use crate::error::ArchiveError;
use crate::protocol::{PeerRef, PeerType, RawObject};
use crate::run_record::{ArchiveRun, ArchiveStatsSnapshot, RunTimer};
use crate::store::schema::dict_datetime;
use crate::target::{Target, TargetType};

/// A conversation as last listed by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Dialog {
    pub id: i64,
    pub chat_type: String,
    pub name: Option<String>,
    pub pinned: bool,
    pub archived_chat: bool,
    pub last_msg_date: Option<DateTime<Utc>>,
    /// Last listed through a takeout session.
    pub used_takeout: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Dialog {
    pub fn target(&self) -> Target {
        match self.chat_type.as_str() {
            "user" => Target::user(self.id),
            _ => Target::chat(self.id),
        }
    }
}

/// `user`, `chat` or `channel`, from the dialog's peer.
pub fn dialog_chat_type(raw: &RawObject) -> &'static str {
    match raw.dict.get("peer").and_then(PeerRef::from_dict).map(|p| p.peer_type) {
        Some(PeerType::User) => "user",
        Some(PeerType::Channel) => "channel",
        _ => "chat",
    }
}

const DIALOG_COLUMNS: &str =
    "id, chat_type, name, pinned, archived_chat, last_msg_date, used_takeout, first_seen, last_seen";

type RawDialog = (i64, String, Option<String>, bool, bool, Option<String>, bool, String, String);

fn raw_dialog(r: &Row<'_>) -> rusqlite::Result<RawDialog> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
    ))
}

fn parse_dialog(raw: RawDialog) -> anyhow::Result<Dialog> {
    let (id, chat_type, name, pinned, archived_chat, last_msg_date, used_takeout, first_seen, last_seen) = raw;
    Ok(Dialog {
        id,
        chat_type,
        name,
        pinned,
        archived_chat,
        last_msg_date: parse_opt_ts(last_msg_date)?,
        used_takeout,
        first_seen: parse_ts(&first_seen)?,
        last_seen: parse_ts(&last_seen)?,
    })
}

const RUN_COLUMNS: &str = "archive_run_id, target_type, target_id, time_queued,
    history_time_start, history_time_latest, history_time_end,
    follow_time_start, follow_time_latest, follow_time_end,
    behaviour_config, completed, failure_reason, archive_stats";

fn timer_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<(Option<String>, Option<String>, Option<String>)> {
    Ok((row.get(offset)?, row.get(offset + 1)?, row.get(offset + 2)?))
}

fn parse_timer(raw: (Option<String>, Option<String>, Option<String>)) -> anyhow::Result<RunTimer> {
    Ok(RunTimer {
        start: parse_opt_ts(raw.0)?,
        latest: parse_opt_ts(raw.1)?,
        end: parse_opt_ts(raw.2)?,
    })
}

type RawRun = (
    String,
    String,
    i64,
    String,
    (Option<String>, Option<String>, Option<String>),
    (Option<String>, Option<String>, Option<String>),
    String,
    Option<bool>,
    Option<String>,
    String,
);

fn raw_run(row: &Row<'_>) -> rusqlite::Result<RawRun> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        timer_from_row(row, 4)?,
        timer_from_row(row, 7)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn run_from_raw(raw: RawRun) -> anyhow::Result<ArchiveRun> {
    let (id, target_type, target_id, time_queued, history, follow, behaviour, completed, failure_reason, stats) = raw;
    let target_type: TargetType = target_type.parse()?;
    let behaviour: BehaviourConfig = serde_json::from_str(&behaviour)?;
    let stats: ArchiveStatsSnapshot = serde_json::from_str(&stats).unwrap_or_default();
    Ok(ArchiveRun {
        archive_run_id: id,
        target: Target { target_type, target_id },
        time_queued: parse_ts(&time_queued)?,
        history: parse_timer(history)?,
        follow: parse_timer(follow)?,
        behaviour,
        completed,
        failure_reason,
        stats,
    })
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|d| format_ts(&d))
}

#[derive(Clone)]
pub struct CoreDb {
    pool: DbPool,
}

impl CoreDb {
    pub fn open(layout: &StoreLayout, pool_size: u32) -> anyhow::Result<Self> {
        let pool = open_pool(&layout.core_db_path(), "core", CORE_MIGRATIONS, pool_size)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // ===== Archive runs =====

    pub fn insert_run(&self, run: &ArchiveRun) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT INTO archive_runs (archive_run_id, target_type, target_id, time_queued, behaviour_config, archive_stats)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.archive_run_id,
                run.target.target_type.as_str(),
                run.target.target_id,
                format_ts(&run.time_queued),
                serde_json::to_string(&run.behaviour)?,
                serde_json::to_string(&run.stats)?,
            ],
        )?;
        info!("Queued archive run {} for {}", run.archive_run_id, run.target);
        self.save_run(run)
    }

    /// Persists timers, counters and completion. Finished runs are immutable.
    pub fn save_run(&self, run: &ArchiveRun) -> anyhow::Result<()> {
        let conn = get_conn(&self.pool)?;
        let merged = run.run_times();
        let updated = conn.execute(
            "UPDATE archive_runs SET
                history_time_start = ?2, history_time_latest = ?3, history_time_end = ?4,
                follow_time_start = ?5, follow_time_latest = ?6, follow_time_end = ?7,
                run_time_start = ?8, run_time_latest = ?9, run_time_end = ?10,
                completed = ?11, failure_reason = ?12, archive_stats = ?13
             WHERE archive_run_id = ?1 AND completed IS NULL",
            params![
                run.archive_run_id,
                opt_ts(run.history.start),
                opt_ts(run.history.latest),
                opt_ts(run.history.end),
                opt_ts(run.follow.start),
                opt_ts(run.follow.latest),
                opt_ts(run.follow.end),
                opt_ts(merged.start),
                opt_ts(merged.latest),
                opt_ts(merged.end),
                run.completed,
                run.failure_reason,
                serde_json::to_string(&run.stats)?,
            ],
        )?;
        if updated == 0 {
            let exists = conn
                .query_row("SELECT 1 FROM archive_runs WHERE archive_run_id = ?1", [&run.archive_run_id], |_| Ok(()))
                .optional()?
                .is_some();
            return Err(if exists {
                ArchiveError::RunFinished(run.archive_run_id.clone()).into()
            } else {
                ArchiveError::RunNotFound(run.archive_run_id.clone()).into()
            });
        }
        Ok(())
    }

    pub fn load_run(&self, archive_run_id: &str) -> anyhow::Result<Option<ArchiveRun>> {
        let conn = get_conn(&self.pool)?;
        let sql = format!("SELECT {} FROM archive_runs WHERE archive_run_id = ?1", RUN_COLUMNS);
        conn.query_row(&sql, [archive_run_id], raw_run)
            .optional()?
            .map(run_from_raw)
            .transpose()
    }

    /// The most recently queued unfinished run for a target.
    pub fn latest_incomplete_run(&self, target: &Target) -> anyhow::Result<Option<ArchiveRun>> {
        let conn = get_conn(&self.pool)?;
        let sql = format!(
            "SELECT {} FROM archive_runs
             WHERE target_type = ?1 AND target_id = ?2 AND completed IS NULL
             ORDER BY time_queued DESC LIMIT 1",
            RUN_COLUMNS
        );
        conn.query_row(&sql, params![target.target_type.as_str(), target.target_id], raw_run)
            .optional()?
            .map(run_from_raw)
            .transpose()
    }

    pub fn runs_for_target(&self, target: &Target) -> anyhow::Result<Vec<ArchiveRun>> {
        let conn = get_conn(&self.pool)?;
        let sql = format!(
            "SELECT {} FROM archive_runs WHERE target_type = ?1 AND target_id = ?2 ORDER BY time_queued",
            RUN_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![target.target_type.as_str(), target.target_id], raw_run)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(run_from_raw).collect()
    }

    /// Merged `run_time_*` columns as stored.
    pub fn stored_run_times(&self, archive_run_id: &str) -> anyhow::Result<Option<RunTimer>> {
        let conn = get_conn(&self.pool)?;
        let raw = conn
            .query_row(
                "SELECT run_time_start, run_time_latest, run_time_end FROM archive_runs WHERE archive_run_id = ?1",
                [archive_run_id],
                |row| timer_from_row(row, 0),
            )
            .optional()?;
        raw.map(parse_timer).transpose()
    }

    // ===== Dialogs =====

    /// Current-state upsert: `first_seen` is kept, `last_seen` always moves.
    pub fn upsert_dialog(
        &self,
        engine: &DedupEngine,
        raw: &RawObject,
        scheme_layer: i32,
        used_takeout: bool,
        seen_at: DateTime<Utc>,
    ) -> anyhow::Result<Decision> {
        with_transaction(&self.pool, |tx| {
            let last: Option<(String, i32, String)> = tx
                .query_row(
                    "SELECT last_seen, archive_tl_scheme_layer, str_repr FROM dialogs WHERE id = ?1",
                    [raw.id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()?;
            let last = last
                .map(|(last_seen, scheme_layer, str_repr)| {
                    Ok::<_, anyhow::Error>(LastSeen {
                        archive_datetime: parse_ts(&last_seen)?,
                        scheme_layer,
                        str_repr,
                        deleted: false,
                        edit_datetime: None,
                    })
                })
                .transpose()?;
            let obs = Observation {
                str_repr: &raw.str_repr,
                scheme_layer,
                deleted: false,
                edit_datetime: None,
                observed_at: seen_at,
            };
            let decision = engine.should_store(WritePolicy::CurrentState, &obs, last.as_ref());

            let dict = &raw.dict;
            let name = dict.get("name").and_then(|v| v.as_str()).map(str::to_string);
            let pinned = dict.get("pinned").and_then(|v| v.as_bool()).unwrap_or(false);
            let archived = dict.get("folder_id").and_then(|v| v.as_i64()) == Some(1)
                || dict.get("archived").and_then(|v| v.as_bool()).unwrap_or(false);
            let last_msg_date = opt_ts(dict.get("date").and_then(dict_datetime));
            let seen = format_ts(&seen_at);

            match decision {
                Decision::Store => {
                    tx.execute(
                        "INSERT INTO dialogs (id, type, str_repr, dict_repr, archive_tl_scheme_layer, chat_type,
                             name, pinned, archived_chat, last_msg_date, used_takeout, first_seen, last_seen)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
                        params![
                            raw.id,
                            raw.type_name,
                            raw.str_repr,
                            raw.dict_repr(),
                            scheme_layer,
                            dialog_chat_type(raw),
                            name,
                            pinned,
                            archived,
                            last_msg_date,
                            used_takeout,
                            seen,
                        ],
                    )?;
                }
                Decision::UpdateInPlace => {
                    tx.execute(
                        "UPDATE dialogs SET type = ?2, str_repr = ?3, dict_repr = ?4, archive_tl_scheme_layer = ?5,
                             chat_type = ?6, name = ?7, pinned = ?8, archived_chat = ?9, last_msg_date = ?10,
                             used_takeout = ?11, last_seen = ?12
                         WHERE id = ?1",
                        params![
                            raw.id,
                            raw.type_name,
                            raw.str_repr,
                            raw.dict_repr(),
                            scheme_layer,
                            dialog_chat_type(raw),
                            name,
                            pinned,
                            archived,
                            last_msg_date,
                            used_takeout,
                            seen,
                        ],
                    )?;
                }
                Decision::Skip => {
                    tx.execute(
                        "UPDATE dialogs SET used_takeout = ?2, last_seen = ?3 WHERE id = ?1",
                        params![raw.id, used_takeout, seen],
                    )?;
                }
            }
            debug!("Dialog {} -> {:?}", raw.id, decision);
            Ok(decision)
        })
    }

    pub fn dialog(&self, id: i64) -> anyhow::Result<Option<Dialog>> {
        let conn = get_conn(&self.pool)?;
        let sql = format!("SELECT {} FROM dialogs WHERE id = ?1", DIALOG_COLUMNS);
        let raw = conn.query_row(&sql, [id], raw_dialog).optional()?;
        raw.map(parse_dialog).transpose()
    }

    pub fn dialogs(&self) -> anyhow::Result<Vec<Dialog>> {
        let conn = get_conn(&self.pool)?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM dialogs ORDER BY id", DIALOG_COLUMNS))?;
        let rows = stmt.query_map([], raw_dialog)?.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(parse_dialog).collect()
    }

    // ===== Global resources =====

    pub fn write_resource(
        &self,
        engine: &DedupEngine,
        row: &ResourceRow,
        scheme_layer: i32,
        observed_at: DateTime<Utc>,
    ) -> anyhow::Result<Decision> {
        with_transaction(&self.pool, |tx| resource::write(tx, engine, row, scheme_layer, observed_at))
    }

    /// Where the latest stored copy of a sticker lives, relative to the store root.
    pub fn sticker_file_path(&self, sticker_id: i64) -> anyhow::Result<Option<String>> {
        let conn = get_conn(&self.pool)?;
        Ok(conn
            .query_row(
                "SELECT file_path FROM stickers WHERE id = ?1 ORDER BY archive_datetime DESC LIMIT 1",
                [sticker_id],
                |r| r.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::{user_row, ResourceKind};
    use chrono::Duration;
    use serde_json::json;

    fn open() -> (tempfile::TempDir, CoreDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoreDb::open(&StoreLayout::new(dir.path()), 2).unwrap();
        (dir, db)
    }

    fn dialog(id: i64, name: &str) -> RawObject {
        RawObject {
            type_name: "Dialog".into(),
            id,
            str_repr: format!("Dialog({}, {})", id, name),
            dict: json!({"peer": {"channel_id": id}, "name": name, "pinned": true, "date": 1_700_000_000}),
        }
    }

    // ===== Archive Run Tests =====

    #[test]
    fn test_run_round_trip() {
        let (_dir, db) = open();
        let mut run = ArchiveRun::new(Target::chat(7), BehaviourConfig::default(), Utc::now());
        db.insert_run(&run).unwrap();
        run.history.start(Utc::now());
        run.stats.messages_seen = 4;
        db.save_run(&run).unwrap();
        let loaded = db.load_run(&run.archive_run_id).unwrap().unwrap();
        assert_eq!(loaded.target, Target::chat(7));
        assert_eq!(loaded.stats.messages_seen, 4);
        assert!(loaded.history.start.is_some());
        assert_eq!(loaded.behaviour, BehaviourConfig::default());
        assert_eq!(db.latest_incomplete_run(&Target::chat(7)).unwrap().unwrap().archive_run_id, run.archive_run_id);
    }

    #[test]
    fn test_finished_run_is_immutable() {
        let (_dir, db) = open();
        let mut run = ArchiveRun::new(Target::user(3), BehaviourConfig::default(), Utc::now());
        db.insert_run(&run).unwrap();
        run.completed = Some(true);
        db.save_run(&run).unwrap();
        run.failure_reason = Some("late write".into());
        let err = db.save_run(&run).unwrap_err();
        assert!(matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::RunFinished(_))));
        assert!(db.latest_incomplete_run(&Target::user(3)).unwrap().is_none());
        assert_eq!(db.load_run(&run.archive_run_id).unwrap().unwrap().failure_reason, None);
    }

    #[test]
    fn test_merged_run_times_are_stored() {
        let (_dir, db) = open();
        let t0 = Utc::now();
        let mut run = ArchiveRun::new(Target::chat(1), BehaviourConfig::default(), t0);
        db.insert_run(&run).unwrap();
        run.history = RunTimer { start: Some(t0), latest: Some(t0 + Duration::seconds(90)), end: Some(t0 + Duration::seconds(90)) };
        run.follow = RunTimer {
            start: Some(t0 + Duration::seconds(10)),
            latest: Some(t0 + Duration::seconds(60)),
            end: Some(t0 + Duration::seconds(60)),
        };
        db.save_run(&run).unwrap();
        let stored = db.stored_run_times(&run.archive_run_id).unwrap().unwrap();
        assert_eq!(stored.start.map(|t| format_ts(&t)), Some(format_ts(&t0)));
        assert_eq!(stored.end.map(|t| format_ts(&t)), Some(format_ts(&(t0 + Duration::seconds(90)))));
    }

    #[test]
    fn test_timer_merge_migration_backfills_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core_db.sqlite");
        {
            let mut conn = rusqlite::Connection::open(&path).unwrap();
            crate::store::MigrationManager::new(&mut conn, "core").apply(&CORE_MIGRATIONS[..1]).unwrap();
            conn.execute(
                "INSERT INTO archive_runs (archive_run_id, target_type, target_id, time_queued,
                    history_time_start, history_time_latest, history_time_end,
                    follow_time_start, follow_time_latest, follow_time_end, behaviour_config, completed)
                 VALUES ('old', 'chat', 1, '2024-01-01T00:00:00.000000Z',
                    '2024-01-01T00:00:01.000000Z', '2024-01-01T00:09:00.000000Z', '2024-01-01T00:10:00.000000Z',
                    '2024-01-01T00:02:00.000000Z', '2024-01-01T00:05:00.000000Z', '2024-01-01T00:05:00.000000Z',
                    '{}', 1)",
                [],
            )
            .unwrap();
        }
        let db = CoreDb::open(&StoreLayout::new(dir.path()), 1).unwrap();
        let stored = db.stored_run_times("old").unwrap().unwrap();
        assert_eq!(stored.start, Some(parse_ts("2024-01-01T00:00:01Z").unwrap()));
        assert_eq!(stored.latest, Some(parse_ts("2024-01-01T00:09:00Z").unwrap()));
        assert_eq!(stored.end, Some(parse_ts("2024-01-01T00:10:00Z").unwrap()));
    }

    // ===== Dialog Tests =====

    #[test]
    fn test_dialog_upsert_keeps_first_seen() {
        let (_dir, db) = open();
        let engine = DedupEngine::from_overlap_days(2);
        let t0 = Utc::now();
        assert_eq!(db.upsert_dialog(&engine, &dialog(5, "a"), 158, false, t0).unwrap(), Decision::Store);
        let later = t0 + Duration::hours(1);
        assert_eq!(db.upsert_dialog(&engine, &dialog(5, "a"), 158, false, later).unwrap(), Decision::Skip);
        let latest = t0 + Duration::hours(2);
        assert_eq!(db.upsert_dialog(&engine, &dialog(5, "b"), 158, true, latest).unwrap(), Decision::UpdateInPlace);

        let stored = db.dialog(5).unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("b"));
        assert_eq!(format_ts(&stored.first_seen), format_ts(&t0));
        assert_eq!(format_ts(&stored.last_seen), format_ts(&latest));
        assert_eq!(stored.chat_type, "channel");
        assert!(stored.pinned);
        assert_eq!(stored.target(), Target::chat(5));
        assert!(stored.used_takeout);
        assert_eq!(db.dialogs().unwrap().len(), 1);
    }

    #[test]
    fn test_dialog_lookup_by_id() {
        let (_dir, db) = open();
        let engine = DedupEngine::from_overlap_days(2);
        for id in [3, 4, 8] {
            db.upsert_dialog(&engine, &dialog(id, "x"), 158, id == 4, Utc::now()).unwrap();
        }
        assert!(!db.dialog(3).unwrap().unwrap().used_takeout);
        assert!(db.dialog(4).unwrap().unwrap().used_takeout);
        assert_eq!(db.dialog(8).unwrap().unwrap().id, 8);
        assert!(db.dialog(5).unwrap().is_none());
    }

    #[test]
    fn test_takeout_flag_follows_the_latest_listing() {
        let (_dir, db) = open();
        let engine = DedupEngine::from_overlap_days(2);
        let t0 = Utc::now();
        db.upsert_dialog(&engine, &dialog(6, "a"), 158, true, t0).unwrap();
        // unchanged content still records how it was listed
        let decision = db.upsert_dialog(&engine, &dialog(6, "a"), 158, false, t0 + Duration::hours(1)).unwrap();
        assert_eq!(decision, Decision::Skip);
        assert!(!db.dialog(6).unwrap().unwrap().used_takeout);
    }

    #[test]
    fn test_global_users_are_versioned() {
        let (_dir, db) = open();
        let engine = DedupEngine::from_overlap_days(2);
        let raw = RawObject { type_name: "User".into(), id: 9, str_repr: "User(9)".into(), dict: json!({"first_name": "Ann"}) };
        let row = user_row(&raw).row;
        assert_eq!(db.write_resource(&engine, &row, 158, Utc::now()).unwrap(), Decision::Store);
        assert_eq!(db.write_resource(&engine, &row, 158, Utc::now()).unwrap(), Decision::Skip);
        assert_eq!(db.write_resource(&engine, &row, 159, Utc::now()).unwrap(), Decision::Store);
        let conn = get_conn(db.pool()).unwrap();
        assert_eq!(resource::version_count(&conn, ResourceKind::User, 9).unwrap(), 2);
    }
}
