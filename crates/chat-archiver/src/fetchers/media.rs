//! Media downloader: message media and web page preview media.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{decode_work, write_file_atomically, ProcessOutcome, ResourceFetcher, RunContext};
use crate::error::ArchiveError;
use crate::metrics;
use crate::queue::{NewEntry, QueueEntry, Subsystem};
use crate::run_record::Stat;
use crate::store::schema::{media_row, MediaRef};
use crate::store::{resource, ChatDb};

const FALLBACK_EXT: &str = "bin";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaWork {
    pub media_id: i64,
    pub media_type: String,
    #[serde(default)]
    pub file_ext: Option<String>,
    #[serde(default)]
    pub web_page_id: Option<i64>,
    #[serde(default)]
    pub dict: Value,
}

impl From<&MediaRef> for MediaWork {
    fn from(media: &MediaRef) -> Self {
        Self {
            media_id: media.media_id,
            media_type: media.media_type.clone(),
            file_ext: media.file_ext.clone(),
            web_page_id: media.web_page_id,
            dict: media.dict.clone(),
        }
    }
}

impl MediaWork {
    pub fn entry(&self, message_id: Option<i64>) -> NewEntry {
        NewEntry::new(
            Subsystem::Media,
            message_id,
            serde_json::to_value(self).unwrap_or(Value::Null),
        )
    }

    fn media_ref(&self) -> MediaRef {
        MediaRef {
            media_id: self.media_id,
            media_type: self.media_type.clone(),
            file_ext: self.file_ext.clone(),
            web_page_id: self.web_page_id,
            dict: self.dict.clone(),
        }
    }

    /// Location relative to the target directory.
    pub fn relative_path(&self) -> String {
        let dir = if self.web_page_id.is_some() { "web_page_media" } else { "media" };
        let ext = self.file_ext.as_deref().filter(|e| !e.is_empty()).unwrap_or(FALLBACK_EXT);
        format!("{}/{}.{}", dir, self.media_id, ext)
    }
}

pub struct MediaDownloader;

#[async_trait]
impl ResourceFetcher for MediaDownloader {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Media
    }

    async fn process(&self, ctx: &RunContext, entry: &QueueEntry) -> anyhow::Result<ProcessOutcome> {
        let work: MediaWork = decode_work(entry)?;
        let message_id = entry.message_id.ok_or_else(|| ArchiveError::InvalidQueueEntry {
            entry_id: entry.queue_entry_id,
            reason: "media entry without a message id".into(),
        })?;
        let relative = work.relative_path();
        let path = ctx.chat_db.dir().join(&relative);

        let file_hash = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!("Media {} already stored at {}", work.media_id, path.display());
            let existing = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            blake3::hash(&existing).to_hex().to_string()
        } else {
            let contents = match ctx.client.download_media(&ctx.target(), message_id, work.media_id).await {
                Ok(contents) => contents,
                Err(e) => {
                    ctx.tolerate_malformed(&format!("media {} of message {}", work.media_id, message_id), e)?;
                    return ctx.commit(entry, |_, _| Ok(Vec::new()));
                }
            };
            write_file_atomically(&path, &contents).await?;
            ctx.count(Stat::MediaDownloaded);
            metrics::inc_media();
            debug!("Downloaded media {} ({} bytes)", work.media_id, contents.len());
            blake3::hash(&contents).to_hex().to_string()
        };

        let row = media_row(&work.media_ref(), &relative, &file_hash);
        let layer = ctx.scheme_layer();
        let observed_at = Utc::now();
        ctx.commit(entry, |tx, _| {
            resource::write(tx, &ctx.engine, &row, layer, observed_at)?;
            if let Some(web_page_id) = work.web_page_id {
                ChatDb::save_web_page_media(tx, layer, observed_at, web_page_id, work.media_id, &relative)?;
            }
            Ok(Vec::new())
        })
    }
}
