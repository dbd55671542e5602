//! Table layouts and the projection of raw objects onto extracted columns.
//!
//! Every history-versioned table shares the same leading columns:
//! `archive_datetime`, `archive_tl_scheme_layer`, `id`, `type`, `str_repr` and
//! `dict_repr`. The remaining columns are a lossy, query-friendly projection of
//! `dict_repr`; when a field cannot be read it is left NULL and the problem is
//! reported as a parse anomaly instead of failing the write.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use super::migration::Migration;
use crate::dedup::WritePolicy;
use crate::protocol::{PeerRef, RawObject};

pub const CORE_MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "initial_setup",
        sql: "CREATE TABLE archive_runs (
                archive_run_id TEXT PRIMARY KEY,
                target_type TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                time_queued TEXT NOT NULL,
                history_time_start TEXT,
                history_time_latest TEXT,
                history_time_end TEXT,
                follow_time_start TEXT,
                follow_time_latest TEXT,
                follow_time_end TEXT,
                behaviour_config TEXT NOT NULL,
                completed INTEGER,
                failure_reason TEXT,
                archive_stats TEXT NOT NULL DEFAULT '{}'
              );
              CREATE INDEX idx_archive_runs_target ON archive_runs (target_type, target_id, time_queued);
              CREATE TABLE dialogs (
                id INTEGER PRIMARY KEY,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                chat_type TEXT NOT NULL,
                name TEXT,
                pinned INTEGER NOT NULL DEFAULT 0,
                archived_chat INTEGER NOT NULL DEFAULT 0,
                last_msg_date TEXT,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
              );
              CREATE TABLE chats (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                title TEXT,
                creation_date TEXT,
                is_creator INTEGER,
                have_left INTEGER,
                is_broadcast_channel INTEGER,
                participants_count INTEGER,
                about TEXT,
                username TEXT,
                other_usernames TEXT,
                migrated_to_chat_id INTEGER,
                migrated_from_chat_id INTEGER,
                linked_chat_id INTEGER,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_chats_id ON chats (id, archive_datetime);
              CREATE TABLE users (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                bio TEXT,
                is_bot INTEGER,
                is_deleted INTEGER,
                first_name TEXT,
                last_name TEXT,
                phone_number TEXT,
                has_premium INTEGER,
                username TEXT,
                other_usernames TEXT,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_users_id ON users (id, archive_datetime);",
    },
    Migration {
        id: 2,
        name: "merge_run_timers",
        sql: "ALTER TABLE archive_runs ADD COLUMN run_time_start TEXT;
              ALTER TABLE archive_runs ADD COLUMN run_time_latest TEXT;
              ALTER TABLE archive_runs ADD COLUMN run_time_end TEXT;
              UPDATE archive_runs SET
                run_time_start = CASE
                  WHEN history_time_start IS NULL THEN follow_time_start
                  WHEN follow_time_start IS NULL THEN history_time_start
                  ELSE MIN(history_time_start, follow_time_start) END,
                run_time_end = CASE
                  WHEN history_time_start IS NOT NULL AND history_time_end IS NULL THEN NULL
                  WHEN follow_time_start IS NOT NULL AND follow_time_end IS NULL THEN NULL
                  WHEN history_time_end IS NULL THEN follow_time_end
                  WHEN follow_time_end IS NULL THEN history_time_end
                  ELSE MAX(history_time_end, follow_time_end) END,
                run_time_latest = CASE
                  WHEN history_time_latest IS NULL THEN follow_time_latest
                  WHEN follow_time_latest IS NULL THEN history_time_latest
                  ELSE MAX(history_time_latest, follow_time_latest) END;
              UPDATE archive_runs SET run_time_latest = run_time_end
                WHERE run_time_end IS NOT NULL AND run_time_latest > run_time_end;
              UPDATE archive_runs SET run_time_latest = run_time_start
                WHERE run_time_start IS NOT NULL AND (run_time_latest IS NULL OR run_time_latest < run_time_start);",
    },
    Migration {
        id: 3,
        name: "add_sticker_tables",
        sql: "CREATE TABLE sticker_sets (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                title TEXT,
                short_name TEXT,
                sticker_count INTEGER,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_sticker_sets_id ON sticker_sets (id, archive_datetime);
              CREATE TABLE stickers (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                sticker_set_id INTEGER,
                emoji TEXT,
                file_ext TEXT,
                file_path TEXT,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_stickers_id ON stickers (id, archive_datetime);",
    },
    Migration {
        id: 4,
        name: "add_dialog_takeout_flag",
        sql: "ALTER TABLE dialogs ADD COLUMN used_takeout INTEGER NOT NULL DEFAULT 0;",
    },
];

pub const CHAT_MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "initial_setup",
        sql: "CREATE TABLE messages (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                datetime TEXT,
                text TEXT,
                media_id INTEGER,
                user_id INTEGER,
                sticker_id INTEGER,
                sticker_set_id INTEGER,
                web_page_id INTEGER,
                deleted INTEGER NOT NULL DEFAULT 0,
                edit_datetime TEXT,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_messages_id ON messages (id, archive_datetime);
              CREATE INDEX idx_messages_datetime ON messages (datetime);
              CREATE TABLE chats (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                title TEXT,
                creation_date TEXT,
                is_creator INTEGER,
                have_left INTEGER,
                is_broadcast_channel INTEGER,
                participants_count INTEGER,
                about TEXT,
                username TEXT,
                other_usernames TEXT,
                migrated_to_chat_id INTEGER,
                migrated_from_chat_id INTEGER,
                linked_chat_id INTEGER,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_chats_id ON chats (id, archive_datetime);
              CREATE TABLE users (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                bio TEXT,
                is_bot INTEGER,
                is_deleted INTEGER,
                first_name TEXT,
                last_name TEXT,
                phone_number TEXT,
                has_premium INTEGER,
                username TEXT,
                other_usernames TEXT,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_users_id ON users (id, archive_datetime);
              CREATE TABLE admin_events (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                datetime TEXT,
                message_id INTEGER,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_admin_events_id ON admin_events (id, archive_datetime);
              CREATE TABLE media (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                id INTEGER NOT NULL,
                type TEXT NOT NULL,
                str_repr TEXT NOT NULL,
                dict_repr TEXT NOT NULL,
                media_type TEXT,
                file_ext TEXT,
                file_path TEXT,
                file_hash TEXT,
                PRIMARY KEY (archive_datetime, id)
              );
              CREATE INDEX idx_media_id ON media (id, archive_datetime);
              CREATE TABLE subsystem_queue (
                queue_entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                subsystem_name TEXT NOT NULL,
                message_id INTEGER,
                extra_data TEXT NOT NULL DEFAULT '{}'
              );
              CREATE INDEX idx_subsystem_queue_name ON subsystem_queue (subsystem_name, queue_entry_id);",
    },
    Migration {
        id: 2,
        name: "add_web_page_media_table",
        sql: "CREATE TABLE web_page_media (
                archive_datetime TEXT NOT NULL,
                archive_tl_scheme_layer INTEGER NOT NULL,
                web_page_id INTEGER NOT NULL,
                media_id INTEGER NOT NULL,
                media_json_path TEXT NOT NULL,
                PRIMARY KEY (archive_datetime, web_page_id, media_id)
              );
              CREATE INDEX idx_web_page_media_ids ON web_page_media (web_page_id, media_id);",
    },
];

/// History-versioned resource tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Message,
    Chat,
    User,
    AdminEvent,
    Media,
    Sticker,
    StickerSet,
}

impl ResourceKind {
    pub fn table(&self) -> &'static str {
        match self {
            ResourceKind::Message => "messages",
            ResourceKind::Chat => "chats",
            ResourceKind::User => "users",
            ResourceKind::AdminEvent => "admin_events",
            ResourceKind::Media => "media",
            ResourceKind::Sticker => "stickers",
            ResourceKind::StickerSet => "sticker_sets",
        }
    }

    pub fn policy(&self) -> WritePolicy {
        match self {
            ResourceKind::Message => WritePolicy::VersionedWithMutableFlags,
            _ => WritePolicy::Versioned,
        }
    }
}

/// A row ready to go through the deduplication gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRow {
    pub kind: ResourceKind,
    pub id: i64,
    pub type_name: String,
    pub str_repr: String,
    pub dict_repr: String,
    pub columns: Vec<(&'static str, SqlValue)>,
    pub deleted: bool,
    pub edit_datetime: Option<String>,
}

impl ResourceRow {
    fn from_raw(kind: ResourceKind, raw: &RawObject) -> Self {
        Self {
            kind,
            id: raw.id,
            type_name: raw.type_name.clone(),
            str_repr: raw.str_repr.clone(),
            dict_repr: raw.dict_repr(),
            columns: Vec::new(),
            deleted: false,
            edit_datetime: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(c, _)| *c == name).map(|(_, v)| v)
    }
}

/// A media reference found in a message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaRef {
    pub media_id: i64,
    pub media_type: String,
    pub file_ext: Option<String>,
    pub web_page_id: Option<i64>,
    pub dict: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StickerRef {
    pub sticker_id: i64,
    pub sticker_set_id: Option<i64>,
    pub file_ext: Option<String>,
}

/// What a message points at, beyond its own row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFacts {
    pub datetime: Option<DateTime<Utc>>,
    pub edit_datetime: Option<DateTime<Utc>>,
    pub sender: Option<PeerRef>,
    pub media: Vec<MediaRef>,
    pub sticker: Option<StickerRef>,
}

#[derive(Debug, Clone)]
pub struct Extracted<F> {
    pub row: ResourceRow,
    pub facts: F,
    pub anomalies: Vec<String>,
}

/// Accepts unix seconds or an RFC 3339 string.
pub fn dict_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

fn opt_text(v: Option<&Value>) -> SqlValue {
    match v {
        Some(Value::String(s)) => SqlValue::Text(s.clone()),
        _ => SqlValue::Null,
    }
}

fn opt_int(v: Option<&Value>) -> SqlValue {
    v.and_then(|v| v.as_i64()).map(SqlValue::Integer).unwrap_or(SqlValue::Null)
}

fn opt_bool(v: Option<&Value>) -> SqlValue {
    v.and_then(|v| v.as_bool())
        .map(|b| SqlValue::Integer(b as i64))
        .unwrap_or(SqlValue::Null)
}

fn opt_ts(v: Option<DateTime<Utc>>) -> SqlValue {
    v.map(|dt| SqlValue::Text(super::format_ts(&dt))).unwrap_or(SqlValue::Null)
}

fn other_usernames(dict: &Value) -> SqlValue {
    match dict.get("usernames").and_then(|v| v.as_array()) {
        Some(names) => {
            let names: Vec<&str> = names
                .iter()
                .filter_map(|n| n.get("username").and_then(|u| u.as_str()).or_else(|| n.as_str()))
                .collect();
            SqlValue::Text(names.join(","))
        }
        None => SqlValue::Null,
    }
}

fn media_ref(dict: &Value, web_page_id: Option<i64>) -> Option<MediaRef> {
    let media_id = dict.get("id").and_then(|v| v.as_i64())?;
    Some(MediaRef {
        media_id,
        media_type: dict.get("_").and_then(|v| v.as_str()).unwrap_or("Media").to_string(),
        file_ext: dict.get("ext").and_then(|v| v.as_str()).map(str::to_string),
        web_page_id,
        dict: dict.clone(),
    })
}

/// Projects a message onto the `messages` columns and collects its references.
///
/// Media shapes understood: `{"_": "...", "id": 1, "ext": "jpg"}` for plain
/// media, with a `"sticker": {"set_id": .., "emoji": ..}` member for stickers,
/// and `{"_": "MessageMediaWebPage", "webpage": {"id": .., "photo": {..},
/// "document": {..}}}` for link previews.
pub fn message_row(raw: &RawObject) -> Extracted<MessageFacts> {
    let mut row = ResourceRow::from_raw(ResourceKind::Message, raw);
    let mut anomalies = Vec::new();
    let mut facts = MessageFacts::default();
    let dict = &raw.dict;

    facts.datetime = dict.get("date").and_then(dict_datetime);
    if facts.datetime.is_none() {
        anomalies.push(format!("message {} has no readable date", raw.id));
    }
    facts.edit_datetime = dict.get("edit_date").and_then(dict_datetime);
    facts.sender = dict.get("from_id").and_then(PeerRef::from_dict);

    let mut media_id = SqlValue::Null;
    let mut sticker_id = SqlValue::Null;
    let mut sticker_set_id = SqlValue::Null;
    let mut web_page_id = SqlValue::Null;
    if let Some(media) = dict.get("media").filter(|m| !m.is_null()) {
        if let Some(webpage) = media.get("webpage").filter(|w| !w.is_null()) {
            let page_id = webpage.get("id").and_then(|v| v.as_i64());
            web_page_id = page_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null);
            for key in ["photo", "document"] {
                if let Some(nested) = webpage.get(key).and_then(|d| media_ref(d, page_id)) {
                    facts.media.push(nested);
                }
            }
        } else if let Some(sticker) = media.get("sticker").filter(|s| !s.is_null()) {
            match media.get("id").and_then(|v| v.as_i64()) {
                Some(id) => {
                    let set_id = sticker.get("set_id").and_then(|v| v.as_i64());
                    sticker_id = SqlValue::Integer(id);
                    sticker_set_id = set_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null);
                    facts.sticker = Some(StickerRef {
                        sticker_id: id,
                        sticker_set_id: set_id,
                        file_ext: media.get("ext").and_then(|v| v.as_str()).map(str::to_string),
                    });
                }
                None => anomalies.push(format!("message {} has a sticker without an id", raw.id)),
            }
        } else {
            match media_ref(media, None) {
                Some(found) => {
                    media_id = SqlValue::Integer(found.media_id);
                    facts.media.push(found);
                }
                None => anomalies.push(format!("message {} has media without an id", raw.id)),
            }
        }
    }

    row.edit_datetime = facts.edit_datetime.map(|dt| super::format_ts(&dt));
    row.columns = vec![
        ("datetime", opt_ts(facts.datetime)),
        ("text", opt_text(dict.get("message"))),
        ("media_id", media_id),
        ("user_id", facts.sender.map(|p| SqlValue::Integer(p.peer_id)).unwrap_or(SqlValue::Null)),
        ("sticker_id", sticker_id),
        ("sticker_set_id", sticker_set_id),
        ("web_page_id", web_page_id),
    ];
    Extracted { row, facts, anomalies }
}

/// Chats and channels. Facts are the linked or migrated chats worth fetching.
pub fn chat_row(raw: &RawObject) -> Extracted<Vec<PeerRef>> {
    let mut row = ResourceRow::from_raw(ResourceKind::Chat, raw);
    let dict = &raw.dict;
    let mut anomalies = Vec::new();
    let creation = dict.get("date").and_then(dict_datetime);
    if dict.get("date").is_some() && creation.is_none() {
        anomalies.push(format!("chat {} has an unreadable creation date", raw.id));
    }
    let migrated_to = dict
        .get("migrated_to")
        .and_then(PeerRef::from_dict)
        .map(|p| p.peer_id)
        .or_else(|| dict.get("migrated_to_chat_id").and_then(|v| v.as_i64()));
    let migrated_from = dict.get("migrated_from_chat_id").and_then(|v| v.as_i64());
    let linked = dict.get("linked_chat_id").and_then(|v| v.as_i64());

    let mut related = Vec::new();
    if let Some(id) = migrated_to {
        related.push(PeerRef::channel(id));
    }
    if let Some(id) = migrated_from {
        related.push(PeerRef::chat(id));
    }
    if let Some(id) = linked {
        related.push(PeerRef::channel(id));
    }

    row.columns = vec![
        ("title", opt_text(dict.get("title"))),
        ("creation_date", opt_ts(creation)),
        ("is_creator", opt_bool(dict.get("creator"))),
        ("have_left", opt_bool(dict.get("left"))),
        ("is_broadcast_channel", opt_bool(dict.get("broadcast"))),
        ("participants_count", opt_int(dict.get("participants_count"))),
        ("about", opt_text(dict.get("about"))),
        ("username", opt_text(dict.get("username"))),
        ("other_usernames", other_usernames(dict)),
        ("migrated_to_chat_id", migrated_to.map(SqlValue::Integer).unwrap_or(SqlValue::Null)),
        ("migrated_from_chat_id", migrated_from.map(SqlValue::Integer).unwrap_or(SqlValue::Null)),
        ("linked_chat_id", linked.map(SqlValue::Integer).unwrap_or(SqlValue::Null)),
    ];
    Extracted { row, facts: related, anomalies }
}

pub fn user_row(raw: &RawObject) -> Extracted<()> {
    let mut row = ResourceRow::from_raw(ResourceKind::User, raw);
    let dict = &raw.dict;
    row.columns = vec![
        ("bio", opt_text(dict.get("about").or_else(|| dict.get("bio")))),
        ("is_bot", opt_bool(dict.get("bot"))),
        ("is_deleted", opt_bool(dict.get("deleted"))),
        ("first_name", opt_text(dict.get("first_name"))),
        ("last_name", opt_text(dict.get("last_name"))),
        ("phone_number", opt_text(dict.get("phone"))),
        ("has_premium", opt_bool(dict.get("premium"))),
        ("username", opt_text(dict.get("username"))),
        ("other_usernames", other_usernames(dict)),
    ];
    Extracted { row, facts: (), anomalies: Vec::new() }
}

/// What an admin log entry did to a message.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminAction {
    DeleteMessage(RawObject),
    EditMessage { previous: RawObject, new: RawObject },
    Other,
}

pub fn admin_event_row(raw: &RawObject) -> Extracted<AdminAction> {
    let mut row = ResourceRow::from_raw(ResourceKind::AdminEvent, raw);
    let dict = &raw.dict;
    let mut anomalies = Vec::new();
    let datetime = dict.get("date").and_then(dict_datetime);
    if datetime.is_none() {
        anomalies.push(format!("admin event {} has no readable date", raw.id));
    }
    let action = dict.get("action").cloned().unwrap_or(Value::Null);
    let nested = |key: &str| -> Option<RawObject> {
        action.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    };
    let kind = action.get("_").and_then(|v| v.as_str()).unwrap_or("");
    let facts = match kind {
        "ChannelAdminLogEventActionDeleteMessage" => match nested("message") {
            Some(msg) => AdminAction::DeleteMessage(msg),
            None => {
                anomalies.push(format!("admin event {} deletes an unreadable message", raw.id));
                AdminAction::Other
            }
        },
        "ChannelAdminLogEventActionEditMessage" => match (nested("prev_message"), nested("new_message")) {
            (Some(previous), Some(new)) => AdminAction::EditMessage { previous, new },
            _ => {
                anomalies.push(format!("admin event {} edits an unreadable message", raw.id));
                AdminAction::Other
            }
        },
        _ => AdminAction::Other,
    };
    let message_id = match &facts {
        AdminAction::DeleteMessage(msg) => Some(msg.id),
        AdminAction::EditMessage { new, .. } => Some(new.id),
        AdminAction::Other => None,
    };
    row.columns = vec![
        ("datetime", opt_ts(datetime)),
        ("message_id", message_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null)),
    ];
    Extracted { row, facts, anomalies }
}

pub fn media_row(media: &MediaRef, file_path: &str, file_hash: &str) -> ResourceRow {
    ResourceRow {
        kind: ResourceKind::Media,
        id: media.media_id,
        type_name: media.media_type.clone(),
        str_repr: format!("{}({})", media.media_type, media.dict),
        dict_repr: media.dict.to_string(),
        columns: vec![
            ("media_type", SqlValue::Text(media.media_type.clone())),
            ("file_ext", media.file_ext.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null)),
            ("file_path", SqlValue::Text(file_path.to_string())),
            ("file_hash", SqlValue::Text(file_hash.to_string())),
        ],
        deleted: false,
        edit_datetime: None,
    }
}

pub fn sticker_row(raw: &RawObject, sticker_set_id: Option<i64>, file_ext: &str, file_path: &str) -> ResourceRow {
    let mut row = ResourceRow::from_raw(ResourceKind::Sticker, raw);
    let emoji = raw
        .dict
        .get("sticker")
        .and_then(|s| s.get("emoji"))
        .or_else(|| raw.dict.get("emoji"));
    row.columns = vec![
        ("sticker_set_id", sticker_set_id.map(SqlValue::Integer).unwrap_or(SqlValue::Null)),
        ("emoji", opt_text(emoji)),
        ("file_ext", SqlValue::Text(file_ext.to_string())),
        ("file_path", SqlValue::Text(file_path.to_string())),
    ];
    row
}

pub fn sticker_set_row(raw: &RawObject) -> ResourceRow {
    let mut row = ResourceRow::from_raw(ResourceKind::StickerSet, raw);
    let dict = &raw.dict;
    row.columns = vec![
        ("title", opt_text(dict.get("title"))),
        ("short_name", opt_text(dict.get("short_name"))),
        ("sticker_count", opt_int(dict.get("count"))),
    ];
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(type_name: &str, id: i64, dict: Value) -> RawObject {
        RawObject { type_name: type_name.into(), id, str_repr: format!("{}({})", type_name, id), dict }
    }

    #[test]
    fn test_plain_message_projection() {
        let extracted = message_row(&raw(
            "Message",
            10,
            json!({"date": 1_700_000_000, "message": "hello", "from_id": {"user_id": 4},
                   "media": {"_": "MessageMediaPhoto", "id": 77, "ext": "jpg"}}),
        ));
        assert!(extracted.anomalies.is_empty());
        assert_eq!(extracted.row.column("text"), Some(&SqlValue::Text("hello".into())));
        assert_eq!(extracted.row.column("media_id"), Some(&SqlValue::Integer(77)));
        assert_eq!(extracted.row.column("user_id"), Some(&SqlValue::Integer(4)));
        assert_eq!(extracted.facts.sender, Some(PeerRef::user(4)));
        assert_eq!(extracted.facts.media.len(), 1);
        assert!(extracted.facts.sticker.is_none());
    }

    #[test]
    fn test_sticker_is_not_media() {
        let extracted = message_row(&raw(
            "Message",
            11,
            json!({"date": 1_700_000_000, "media": {"_": "MessageMediaDocument", "id": 5, "sticker": {"set_id": 9}}}),
        ));
        assert!(extracted.facts.media.is_empty());
        let sticker = extracted.facts.sticker.unwrap();
        assert_eq!((sticker.sticker_id, sticker.sticker_set_id), (5, Some(9)));
        assert_eq!(extracted.row.column("media_id"), Some(&SqlValue::Null));
    }

    #[test]
    fn test_web_page_media_is_collected() {
        let extracted = message_row(&raw(
            "Message",
            12,
            json!({"date": 1_700_000_000, "media": {"_": "MessageMediaWebPage",
                   "webpage": {"id": 300, "photo": {"_": "Photo", "id": 301, "ext": "jpg"},
                               "document": {"_": "Document", "id": 302, "ext": "mp4"}}}}),
        ));
        let ids: Vec<(i64, Option<i64>)> =
            extracted.facts.media.iter().map(|m| (m.media_id, m.web_page_id)).collect();
        assert_eq!(ids, vec![(301, Some(300)), (302, Some(300))]);
        assert_eq!(extracted.row.column("web_page_id"), Some(&SqlValue::Integer(300)));
    }

    #[test]
    fn test_missing_date_is_an_anomaly_not_an_error() {
        let extracted = message_row(&raw("Message", 13, json!({"message": "x"})));
        assert_eq!(extracted.anomalies.len(), 1);
        assert_eq!(extracted.row.column("datetime"), Some(&SqlValue::Null));
        assert_eq!(extracted.row.str_repr, "Message(13)");
    }

    #[test]
    fn test_chat_related_peers() {
        let extracted = chat_row(&raw(
            "Channel",
            20,
            json!({"title": "News", "broadcast": true, "linked_chat_id": 21, "migrated_from_chat_id": 19}),
        ));
        assert_eq!(extracted.facts, vec![PeerRef::chat(19), PeerRef::channel(21)]);
        assert_eq!(extracted.row.column("is_broadcast_channel"), Some(&SqlValue::Integer(1)));
    }

    #[test]
    fn test_admin_delete_action() {
        let deleted = json!({"type_name": "Message", "id": 44, "str_repr": "Message(44)", "dict": {}});
        let extracted = admin_event_row(&raw(
            "ChannelAdminLogEvent",
            1,
            json!({"date": 1_700_000_000, "action": {"_": "ChannelAdminLogEventActionDeleteMessage", "message": deleted}}),
        ));
        assert!(matches!(extracted.facts, AdminAction::DeleteMessage(ref m) if m.id == 44));
        assert_eq!(extracted.row.column("message_id"), Some(&SqlValue::Integer(44)));
    }
}
