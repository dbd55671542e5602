//! A [`ProtocolClient`] that serves a previously exported JSON dump.
//!
//! Used to re-import exports into an archive, and by the tests, which also use
//! its failure injection and call hook to simulate flaky networks and crashes.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DialogList, LiveBatch, LiveEvent, PeerRef, PeerType, ProtocolClient, RawObject, StickerSetInfo};
use crate::error::ClientError;
use crate::target::Target;

pub const DEFAULT_SCHEME_LAYER: i32 = 158;

fn default_scheme_layer() -> i32 {
    DEFAULT_SCHEME_LAYER
}

/// Contents of an export dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayData {
    #[serde(default = "default_scheme_layer")]
    pub scheme_layer: i32,
    #[serde(default)]
    pub dialogs: Vec<RawObject>,
    /// The export was taken through a takeout session.
    #[serde(default)]
    pub takeout: bool,
    #[serde(default)]
    pub histories: HashMap<Target, Vec<RawObject>>,
    #[serde(default)]
    pub admin_logs: HashMap<Target, Vec<RawObject>>,
    #[serde(default)]
    pub live_events: HashMap<Target, Vec<LiveEvent>>,
    #[serde(default)]
    pub sticker_sets: HashMap<i64, StickerSetInfo>,
    /// Keyed by `user:<id>`, `chat:<id>` or `channel:<id>`.
    #[serde(default)]
    pub peers: HashMap<String, RawObject>,
    /// File contents by media id. Media missing here is synthesised.
    #[serde(default)]
    pub media: HashMap<i64, String>,
}

type CallHook = Arc<dyn Fn(&str, usize) + Send + Sync>;

pub struct ReplayClient {
    data: RwLock<ReplayData>,
    failures: Mutex<HashMap<String, VecDeque<ClientError>>>,
    calls: DashMap<String, usize>,
    hook: Mutex<Option<CallHook>>,
}

fn peer_key(peer: &PeerRef) -> String {
    let kind = match peer.peer_type {
        PeerType::User => "user",
        PeerType::Chat => "chat",
        PeerType::Channel => "channel",
    };
    format!("{}:{}", kind, peer.peer_id)
}

impl ReplayClient {
    pub fn new(data: ReplayData) -> Self {
        Self {
            data: RwLock::new(data),
            failures: Mutex::new(HashMap::new()),
            calls: DashMap::new(),
            hook: Mutex::new(None),
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay dump {}", path.display()))?;
        let data: ReplayData = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse replay dump {}", path.display()))?;
        Ok(Self::new(data))
    }

    /// Queue an error to be returned by the next call of `operation`.
    pub fn inject_failure(&self, operation: &str, err: ClientError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        failures.entry(operation.to_string()).or_default().push_back(err);
    }

    /// Called with the operation name and its call count before every call.
    pub fn set_call_hook(&self, hook: impl Fn(&str, usize) + Send + Sync + 'static) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(hook));
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    pub fn push_message(&self, target: Target, message: RawObject) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let history = data.histories.entry(target).or_default();
        history.retain(|m| m.id != message.id);
        history.push(message);
    }

    pub fn push_live_event(&self, target: Target, event: LiveEvent) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.live_events.entry(target).or_default().push(event);
    }

    fn record(&self, operation: &str) -> Result<(), ClientError> {
        let count = {
            let mut entry = self.calls.entry(operation.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            hook(operation, count);
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(err) => {
                debug!("Injected failure for {}: {}", operation, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ReplayData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ProtocolClient for ReplayClient {
    fn scheme_layer(&self) -> i32 {
        self.read().scheme_layer
    }

    async fn list_dialogs(&self) -> Result<DialogList, ClientError> {
        self.record("list_dialogs")?;
        let data = self.read();
        Ok(DialogList {
            dialogs: data.dialogs.clone(),
            used_takeout: data.takeout,
        })
    }

    async fn history_page(
        &self,
        target: &Target,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<RawObject>, ClientError> {
        self.record("history_page")?;
        let data = self.read();
        let mut page: Vec<RawObject> = data
            .histories
            .get(target)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| offset_id.map_or(true, |offset| m.id < offset))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        page.sort_by(|a, b| b.id.cmp(&a.id));
        page.truncate(limit);
        Ok(page)
    }

    async fn admin_log(&self, target: &Target) -> Result<Vec<RawObject>, ClientError> {
        self.record("admin_log")?;
        match self.read().admin_logs.get(target) {
            Some(events) => Ok(events.clone()),
            None => Err(ClientError::PermissionDenied(format!("no admin log for {}", target))),
        }
    }

    async fn poll_live_events(&self, target: &Target, cursor: u64) -> Result<LiveBatch, ClientError> {
        self.record("poll_live_events")?;
        let data = self.read();
        let events = data.live_events.get(target).cloned().unwrap_or_default();
        let start = (cursor as usize).min(events.len());
        Ok(LiveBatch {
            events: events[start..].to_vec(),
            cursor: events.len() as u64,
        })
    }

    async fn download_media(
        &self,
        target: &Target,
        message_id: i64,
        media_id: i64,
    ) -> Result<Bytes, ClientError> {
        self.record("download_media")?;
        let data = self.read();
        let content = data
            .media
            .get(&media_id)
            .cloned()
            .unwrap_or_else(|| format!("media {} from message {} in {}", media_id, message_id, target));
        Ok(Bytes::from(content))
    }

    async fn sticker_set(&self, sticker_set_id: i64) -> Result<StickerSetInfo, ClientError> {
        self.record("sticker_set")?;
        self.read()
            .sticker_sets
            .get(&sticker_set_id)
            .cloned()
            .ok_or_else(|| ClientError::Malformed(format!("unknown sticker set {}", sticker_set_id)))
    }

    async fn download_sticker(&self, sticker_id: i64) -> Result<Bytes, ClientError> {
        self.record("download_sticker")?;
        Ok(Bytes::from(format!("sticker {}", sticker_id)))
    }

    async fn full_peer(&self, peer: &PeerRef) -> Result<RawObject, ClientError> {
        self.record("full_peer")?;
        let key = peer_key(peer);
        if let Some(found) = self.read().peers.get(&key) {
            return Ok(found.clone());
        }
        let type_name = match peer.peer_type {
            PeerType::User => "User",
            PeerType::Chat => "Chat",
            PeerType::Channel => "Channel",
        };
        Ok(RawObject {
            type_name: type_name.to_string(),
            id: peer.peer_id,
            str_repr: format!("{}(id={})", type_name, peer.peer_id),
            dict: serde_json::json!({ "_": type_name, "id": peer.peer_id }),
        })
    }
}
