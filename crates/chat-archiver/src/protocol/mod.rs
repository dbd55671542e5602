//! Boundary to the remote messaging service.
//!
//! The archiver never speaks the wire protocol itself. Everything it needs is
//! behind [`ProtocolClient`], and objects cross the boundary as [`RawObject`]s
//! carrying both renderings the store keeps.
pub mod replay;

pub use replay::{ReplayClient, ReplayData};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::target::Target;

/// An object as received from the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    pub type_name: String,
    pub id: i64,
    pub str_repr: String,
    #[serde(default)]
    pub dict: serde_json::Value,
}

impl RawObject {
    pub fn dict_repr(&self) -> String {
        self.dict.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    User,
    Chat,
    Channel,
}

/// Reference to a user, small chat or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub peer_type: PeerType,
    pub peer_id: i64,
}

impl PeerRef {
    pub fn user(peer_id: i64) -> Self {
        Self { peer_type: PeerType::User, peer_id }
    }

    pub fn chat(peer_id: i64) -> Self {
        Self { peer_type: PeerType::Chat, peer_id }
    }

    pub fn channel(peer_id: i64) -> Self {
        Self { peer_type: PeerType::Channel, peer_id }
    }

    /// Reads a `{"_": "PeerUser", "user_id": 1}` style peer from a dict.
    pub fn from_dict(value: &serde_json::Value) -> Option<Self> {
        if let Some(id) = value.get("user_id").and_then(|v| v.as_i64()) {
            return Some(Self::user(id));
        }
        if let Some(id) = value.get("channel_id").and_then(|v| v.as_i64()) {
            return Some(Self::channel(id));
        }
        value.get("chat_id").and_then(|v| v.as_i64()).map(Self::chat)
    }

    pub fn cache_key(&self) -> String {
        format!("{:?}:{}", self.peer_type, self.peer_id)
    }
}

/// Event pushed by the service while following a target live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LiveEvent {
    NewMessage { message: RawObject },
    EditedMessage { message: RawObject },
    DeletedMessages { ids: Vec<i64> },
}

/// The account's dialogs, and whether they were listed through a takeout
/// session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogList {
    pub dialogs: Vec<RawObject>,
    pub used_takeout: bool,
}

/// Events received since a cursor, plus the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveBatch {
    pub events: Vec<LiveEvent>,
    pub cursor: u64,
}

/// A sticker pack and every sticker document in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerSetInfo {
    pub set: RawObject,
    pub stickers: Vec<RawObject>,
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Schema layer objects are currently decoded with.
    fn scheme_layer(&self) -> i32;

    async fn list_dialogs(&self) -> Result<DialogList, ClientError>;

    /// Messages with an id below `offset_id` (or the newest when `None`),
    /// newest first. An empty page means the start of history was reached.
    async fn history_page(
        &self,
        target: &Target,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawObject>, ClientError>;

    async fn admin_log(&self, target: &Target) -> Result<Vec<RawObject>, ClientError>;

    async fn poll_live_events(&self, target: &Target, cursor: u64) -> Result<LiveBatch, ClientError>;

    async fn download_media(
        &self,
        target: &Target,
        message_id: i64,
        media_id: i64,
    ) -> Result<Bytes, ClientError>;

    async fn sticker_set(&self, sticker_set_id: i64) -> Result<StickerSetInfo, ClientError>;

    async fn download_sticker(&self, sticker_id: i64) -> Result<Bytes, ClientError>;

    async fn full_peer(&self, peer: &PeerRef) -> Result<RawObject, ClientError>;
}
