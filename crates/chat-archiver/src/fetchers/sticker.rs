//! Sticker downloader. Stickers and packs are global, so their rows live in
//! the core store and their files under `<root>/stickers/`.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::{decode_work, write_file_atomically, ProcessOutcome, ResourceFetcher, RunContext};
use crate::metrics;
use crate::protocol::RawObject;
use crate::queue::{NewEntry, QueueEntry, Subsystem};
use crate::run_record::Stat;
use crate::store::schema::{sticker_row, sticker_set_row};
use crate::store::DEFAULT_STICKER_EXT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerWork {
    pub sticker_id: i64,
    #[serde(default)]
    pub sticker_set_id: Option<i64>,
    #[serde(default)]
    pub file_ext: Option<String>,
    /// The sticker document, when it came from a pack listing.
    #[serde(default)]
    pub document: Option<RawObject>,
}

impl StickerWork {
    pub fn entry(&self, message_id: Option<i64>) -> NewEntry {
        NewEntry::new(
            Subsystem::Sticker,
            message_id,
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }

    fn file_ext(&self) -> &str {
        self.file_ext.as_deref().filter(|e| !e.is_empty()).unwrap_or(DEFAULT_STICKER_EXT)
    }

    fn document(&self) -> RawObject {
        self.document.clone().unwrap_or_else(|| RawObject {
            type_name: "Document".into(),
            id: self.sticker_id,
            str_repr: format!("Document(id={}, sticker_set_id={:?})", self.sticker_id, self.sticker_set_id),
            dict: json!({
                "_": "Document",
                "id": self.sticker_id,
                "ext": self.file_ext(),
                "sticker": {"set_id": self.sticker_set_id},
            }),
        })
    }
}

fn pack_member(doc: &RawObject, sticker_set_id: i64) -> StickerWork {
    StickerWork {
        sticker_id: doc.id,
        sticker_set_id: Some(sticker_set_id),
        file_ext: doc.dict.get("ext").and_then(|v| v.as_str()).map(str::to_string),
        document: Some(doc.clone()),
    }
}

pub struct StickerDownloader;

impl StickerDownloader {
    /// Fetches a pack the first time one of its stickers turns up in a
    /// message, queueing the rest of it.
    async fn discover_pack(
        &self,
        ctx: &RunContext,
        work: &StickerWork,
        message_id: Option<i64>,
    ) -> anyhow::Result<Vec<NewEntry>> {
        let set_id = match work.sticker_set_id {
            Some(id) if work.document.is_none() && !ctx.caches.sticker_sets.contains_key(&id) => id,
            _ => return Ok(Vec::new()),
        };
        match ctx.client.sticker_set(set_id).await {
            Ok(info) => {
                let row = sticker_set_row(&info.set);
                ctx.core_db.write_resource(&ctx.engine, &row, ctx.scheme_layer(), Utc::now())?;
                info!("Discovered sticker pack {} with {} stickers", set_id, info.stickers.len());
                Ok(info
                    .stickers
                    .iter()
                    .filter(|doc| doc.id != work.sticker_id)
                    .map(|doc| pack_member(doc, set_id).entry(message_id))
                    .collect())
            }
            Err(e) => {
                ctx.tolerate_malformed(&format!("sticker set {}", set_id), e)?;
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait]
impl ResourceFetcher for StickerDownloader {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Sticker
    }

    async fn process(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome> {
        let work: StickerWork = decode_work(entry)?;
        let derived = self.discover_pack(ctx, &work, entry.message_id).await?;

        let path = ctx
            .layout
            .sticker_path(work.sticker_set_id, work.sticker_id, Some(work.file_ext()));
        let relative = path
            .strip_prefix(ctx.layout.root())
            .unwrap_or(Path::new(&path))
            .to_string_lossy()
            .replace('\\', "/");

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Sticker {} already stored", work.sticker_id);
        } else {
            let contents = match ctx.client.download_sticker(work.sticker_id).await {
                Ok(contents) => contents,
                Err(e) => {
                    ctx.tolerate_malformed(&format!("sticker {}", work.sticker_id), e)?;
                    return ctx.commit(entry, |_, _| Ok(derived));
                }
            };
            write_file_atomically(&path, &contents).await?;
            ctx.count(Stat::StickersDownloaded);
            metrics::inc_stickers();
        }

        let row = sticker_row(&work.document(), work.sticker_set_id, work.file_ext(), &relative);
        ctx.core_db
            .write_resource(&ctx.engine, &row, ctx.scheme_layer(), Utc::now())?;
        let outcome = ctx.commit(entry, |_, _| Ok(derived))?;
        if let Some(set_id) = work.sticker_set_id {
            ctx.caches.sticker_sets.insert(set_id, ());
        }
        Ok(outcome)
    }
}
