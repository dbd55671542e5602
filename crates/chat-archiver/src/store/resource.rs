//! Writes to history-versioned tables, always through a [`DedupEngine`].

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::schema::{ResourceKind, ResourceRow};
use super::{format_ts, parse_ts};
use crate::dedup::{Decision, DedupEngine, LastSeen, Observation, WritePolicy};

const BASE_COLUMNS: [&str; 6] = [
    "archive_datetime",
    "archive_tl_scheme_layer",
    "id",
    "type",
    "str_repr",
    "dict_repr",
];

fn has_flags(kind: ResourceKind) -> bool {
    kind.policy() == WritePolicy::VersionedWithMutableFlags
}

/// The latest stored row for `id`, if any.
pub fn last_seen(conn: &Connection, kind: ResourceKind, id: i64) -> anyhow::Result<Option<LastSeen>> {
    let flags = if has_flags(kind) { "deleted, edit_datetime" } else { "0, NULL" };
    let sql = format!(
        "SELECT archive_datetime, archive_tl_scheme_layer, str_repr, {} FROM {}
         WHERE id = ?1 ORDER BY archive_datetime DESC LIMIT 1",
        flags,
        kind.table()
    );
    let row: Option<(String, i32, String, bool, Option<String>)> = conn
        .query_row(&sql, [id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)))
        .optional()?;
    row.map(|(archive_datetime, scheme_layer, str_repr, deleted, edit_datetime)| {
        Ok::<_, anyhow::Error>(LastSeen {
            archive_datetime: parse_ts(&archive_datetime)?,
            scheme_layer,
            str_repr,
            deleted,
            edit_datetime,
        })
    })
    .transpose()
}

/// Passes `row` through the engine and applies the decision.
pub fn write(
    conn: &Connection,
    engine: &DedupEngine,
    row: &ResourceRow,
    scheme_layer: i32,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<Decision> {
    let last = last_seen(conn, row.kind, row.id)?;
    let obs = Observation {
        str_repr: &row.str_repr,
        scheme_layer,
        deleted: row.deleted,
        edit_datetime: row.edit_datetime.as_deref(),
        observed_at,
    };
    let decision = engine.should_store(row.kind.policy(), &obs, last.as_ref());
    match (&decision, &last) {
        (Decision::Store, _) => insert(conn, row, scheme_layer, observed_at)?,
        (Decision::UpdateInPlace, Some(last)) => update_latest(conn, row, scheme_layer, &last.archive_datetime)?,
        _ => {}
    }
    debug!("{} {} -> {:?}", row.kind.table(), row.id, decision);
    Ok(decision)
}

/// First free `archive_datetime` at or after `at` for this object. Versions
/// are keyed by (id, archive_datetime) and are never overwritten.
fn free_slot(conn: &Connection, kind: ResourceKind, id: i64, mut at: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1 AND archive_datetime = ?2", kind.table());
    let mut stmt = conn.prepare(&sql)?;
    while stmt.exists(params![id, format_ts(&at)])? {
        at += Duration::microseconds(1);
    }
    Ok(at)
}

fn insert(conn: &Connection, row: &ResourceRow, scheme_layer: i32, observed_at: DateTime<Utc>) -> anyhow::Result<()> {
    let observed_at = free_slot(conn, row.kind, row.id, observed_at)?;
    let mut names: Vec<&str> = BASE_COLUMNS.to_vec();
    let mut values: Vec<SqlValue> = vec![
        SqlValue::Text(format_ts(&observed_at)),
        SqlValue::Integer(scheme_layer as i64),
        SqlValue::Integer(row.id),
        SqlValue::Text(row.type_name.clone()),
        SqlValue::Text(row.str_repr.clone()),
        SqlValue::Text(row.dict_repr.clone()),
    ];
    for (name, value) in &row.columns {
        names.push(*name);
        values.push(value.clone());
    }
    if has_flags(row.kind) {
        names.push("deleted");
        values.push(SqlValue::Integer(row.deleted as i64));
        names.push("edit_datetime");
        values.push(row.edit_datetime.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        row.kind.table(),
        names.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Rewrites the latest row. Only reachable for current-state and mutable-flag
/// policies, where an edit supersedes the stored content.
fn update_latest(
    conn: &Connection,
    row: &ResourceRow,
    scheme_layer: i32,
    archive_datetime: &DateTime<Utc>,
) -> anyhow::Result<()> {
    let mut sets: Vec<String> = vec![
        "archive_tl_scheme_layer = ?1".into(),
        "type = ?2".into(),
        "str_repr = ?3".into(),
        "dict_repr = ?4".into(),
    ];
    let mut values: Vec<SqlValue> = vec![
        SqlValue::Integer(scheme_layer as i64),
        SqlValue::Text(row.type_name.clone()),
        SqlValue::Text(row.str_repr.clone()),
        SqlValue::Text(row.dict_repr.clone()),
    ];
    for (name, value) in &row.columns {
        values.push(value.clone());
        sets.push(format!("{} = ?{}", name, values.len()));
    }
    if has_flags(row.kind) {
        values.push(SqlValue::Integer(row.deleted as i64));
        sets.push(format!("deleted = ?{}", values.len()));
        values.push(row.edit_datetime.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null));
        sets.push(format!("edit_datetime = ?{}", values.len()));
    }
    values.push(SqlValue::Integer(row.id));
    let id_idx = values.len();
    values.push(SqlValue::Text(format_ts(archive_datetime)));
    let dt_idx = values.len();
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{} AND archive_datetime = ?{}",
        row.kind.table(),
        sets.join(", "),
        id_idx,
        dt_idx
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Stores `row` as a version older than everything held for its id, unless
/// an identical rendering is already stored. Used when an older copy turns up
/// after a newer one, as with the "before" side of a logged edit.
pub fn insert_earlier_version(
    conn: &Connection,
    row: &ResourceRow,
    scheme_layer: i32,
    fallback: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1 AND str_repr = ?2", row.kind.table());
    if conn.prepare(&sql)?.exists(params![row.id, row.str_repr])? {
        return Ok(false);
    }
    let sql = format!("SELECT MIN(archive_datetime) FROM {} WHERE id = ?1", row.kind.table());
    let earliest: Option<String> = conn.query_row(&sql, [row.id], |r| r.get(0))?;
    let at = match earliest {
        Some(earliest) => parse_ts(&earliest)? - Duration::milliseconds(1),
        None => fallback,
    };
    insert(conn, row, scheme_layer, at)?;
    debug!("{} {} -> earlier version at {}", row.kind.table(), row.id, format_ts(&at));
    Ok(true)
}

/// Flags the latest stored copy of a message as deleted. Returns whether
/// anything changed; unknown and already-deleted messages are left alone.
pub fn mark_message_deleted(
    conn: &Connection,
    engine: &DedupEngine,
    message_id: i64,
    observed_at: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let last = match last_seen(conn, ResourceKind::Message, message_id)? {
        Some(last) => last,
        None => return Ok(false),
    };
    let obs = Observation {
        str_repr: &last.str_repr,
        scheme_layer: last.scheme_layer,
        deleted: true,
        edit_datetime: last.edit_datetime.as_deref(),
        observed_at,
    };
    match engine.should_store(WritePolicy::VersionedWithMutableFlags, &obs, Some(&last)) {
        Decision::UpdateInPlace => {
            conn.execute(
                "UPDATE messages SET deleted = 1 WHERE id = ?1 AND archive_datetime = ?2",
                params![message_id, format_ts(&last.archive_datetime)],
            )?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Number of stored versions of an object.
pub fn version_count(conn: &Connection, kind: ResourceKind, id: i64) -> anyhow::Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?1", kind.table());
    Ok(conn.query_row(&sql, [id], |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RawObject;
    use crate::store::schema::{message_row, CHAT_MIGRATIONS};
    use crate::store::MigrationManager;
    use serde_json::json;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn, "chat").apply(CHAT_MIGRATIONS).unwrap();
        conn
    }

    fn message(id: i64, text: &str, edit: Option<i64>) -> ResourceRow {
        let mut dict = json!({"date": 1_700_000_000, "message": text});
        if let Some(edit) = edit {
            dict["edit_date"] = json!(edit);
        }
        let raw = RawObject { type_name: "Message".into(), id, str_repr: format!("Message({}, {})", id, text), dict };
        message_row(&raw).row
    }

    #[test]
    fn test_repeat_observation_stores_one_row() {
        let conn = conn();
        let engine = DedupEngine::from_overlap_days(2);
        let now = Utc::now();
        assert_eq!(write(&conn, &engine, &message(1, "hi", None), 158, now).unwrap(), Decision::Store);
        assert_eq!(
            write(&conn, &engine, &message(1, "hi", None), 158, now + Duration::hours(1)).unwrap(),
            Decision::Skip
        );
        assert_eq!(version_count(&conn, ResourceKind::Message, 1).unwrap(), 1);
        // Past the window the same content gets a fresh row.
        assert_eq!(
            write(&conn, &engine, &message(1, "hi", None), 158, now + Duration::days(3)).unwrap(),
            Decision::Store
        );
        assert_eq!(version_count(&conn, ResourceKind::Message, 1).unwrap(), 2);
    }

    #[test]
    fn test_edit_updates_in_place() {
        let conn = conn();
        let engine = DedupEngine::from_overlap_days(2);
        let now = Utc::now();
        write(&conn, &engine, &message(5, "before", None), 158, now).unwrap();
        let decision = write(&conn, &engine, &message(5, "after", Some(1_700_000_500)), 158, now).unwrap();
        assert_eq!(decision, Decision::UpdateInPlace);
        assert_eq!(version_count(&conn, ResourceKind::Message, 5).unwrap(), 1);
        let (text, edit): (String, Option<String>) = conn
            .query_row("SELECT text, edit_datetime FROM messages WHERE id = 5", [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(text, "after");
        assert!(edit.is_some());
    }

    #[test]
    fn test_delete_updates_in_place_once() {
        let conn = conn();
        let engine = DedupEngine::from_overlap_days(2);
        write(&conn, &engine, &message(8, "bye", None), 158, Utc::now()).unwrap();
        assert!(mark_message_deleted(&conn, &engine, 8, Utc::now()).unwrap());
        assert!(!mark_message_deleted(&conn, &engine, 8, Utc::now()).unwrap());
        assert!(!mark_message_deleted(&conn, &engine, 999, Utc::now()).unwrap());
        assert_eq!(version_count(&conn, ResourceKind::Message, 8).unwrap(), 1);
        let deleted: bool = conn.query_row("SELECT deleted FROM messages WHERE id = 8", [], |r| r.get(0)).unwrap();
        assert!(deleted);
    }

    #[test]
    fn test_same_instant_versions_are_both_kept() {
        let conn = conn();
        // 0 disables age-based re-storing, so only a new rendering stores
        let engine = DedupEngine::from_overlap_days(0);
        let now = Utc::now();
        assert_eq!(write(&conn, &engine, &message(3, "one", None), 158, now).unwrap(), Decision::Store);
        assert_eq!(write(&conn, &engine, &message(3, "two", None), 158, now).unwrap(), Decision::Store);
        assert_eq!(version_count(&conn, ResourceKind::Message, 3).unwrap(), 2);
        let mut stmt = conn.prepare("SELECT text FROM messages WHERE id = 3 ORDER BY archive_datetime").unwrap();
        let texts: Vec<String> = stmt.query_map([], |r| r.get(0)).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(texts, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_earlier_version_sorts_before_latest() {
        let conn = conn();
        let engine = DedupEngine::from_overlap_days(2);
        let now = Utc::now();
        write(&conn, &engine, &message(4, "after", Some(1_700_000_500)), 158, now).unwrap();
        assert!(insert_earlier_version(&conn, &message(4, "before", None), 158, now).unwrap());
        // the same rendering is not stored twice
        assert!(!insert_earlier_version(&conn, &message(4, "before", None), 158, now).unwrap());
        assert_eq!(version_count(&conn, ResourceKind::Message, 4).unwrap(), 2);
        let latest = last_seen(&conn, ResourceKind::Message, 4).unwrap().unwrap();
        assert_eq!(latest.str_repr, "Message(4, after)");
        assert!(latest.edit_datetime.is_some());
    }
}
