use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder};
use std::sync::OnceLock;
#[cfg(feature = "cli")]
use axum::http::StatusCode;
#[cfg(feature = "cli")]
use axum::response::IntoResponse;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

struct ArchiveMetrics {
    messages_saved: IntCounter,
    messages_deleted: IntCounter,
    admin_events_saved: IntCounter,
    media_downloaded: IntCounter,
    stickers_downloaded: IntCounter,
    peers_fetched: IntCounter,
    runs_finished: IntCounterVec,
    active_runs: IntGauge,
    queue_depth: IntGaugeVec,
    fetch_seconds: HistogramVec,
}

static METRICS: OnceLock<ArchiveMetrics> = OnceLock::new();

fn build() -> prometheus::Result<ArchiveMetrics> {
    Ok(ArchiveMetrics {
        messages_saved: IntCounter::new("archive_messages_saved_total", "Message rows stored or updated")?,
        messages_deleted: IntCounter::new("archive_messages_deleted_total", "Messages flagged as deleted")?,
        admin_events_saved: IntCounter::new("archive_admin_events_saved_total", "Admin log events stored")?,
        media_downloaded: IntCounter::new("archive_media_downloaded_total", "Media files downloaded")?,
        stickers_downloaded: IntCounter::new("archive_stickers_downloaded_total", "Sticker files downloaded")?,
        peers_fetched: IntCounter::new("archive_peers_fetched_total", "Full peer lookups")?,
        runs_finished: IntCounterVec::new(
            prometheus::opts!("archive_runs_finished_total", "Archive runs by final status"),
            &["status"],
        )?,
        active_runs: IntGauge::new("archive_active_runs", "Archive runs in progress")?,
        queue_depth: IntGaugeVec::new(
            prometheus::opts!("archive_queue_depth", "Queued entries per subsystem"),
            &["target", "subsystem"],
        )?,
        fetch_seconds: HistogramVec::new(
            HistogramOpts::new("archive_fetch_duration_seconds", "Time spent processing one queue entry"),
            &["subsystem"],
        )?,
    })
}

pub fn init_metrics() -> anyhow::Result<()> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = build()?;
    REGISTRY.register(Box::new(metrics.messages_saved.clone())).ok();
    REGISTRY.register(Box::new(metrics.messages_deleted.clone())).ok();
    REGISTRY.register(Box::new(metrics.admin_events_saved.clone())).ok();
    REGISTRY.register(Box::new(metrics.media_downloaded.clone())).ok();
    REGISTRY.register(Box::new(metrics.stickers_downloaded.clone())).ok();
    REGISTRY.register(Box::new(metrics.peers_fetched.clone())).ok();
    REGISTRY.register(Box::new(metrics.runs_finished.clone())).ok();
    REGISTRY.register(Box::new(metrics.active_runs.clone())).ok();
    REGISTRY.register(Box::new(metrics.queue_depth.clone())).ok();
    REGISTRY.register(Box::new(metrics.fetch_seconds.clone())).ok();
    let _ = METRICS.set(metrics);
    Ok(())
}

fn with_metrics(f: impl FnOnce(&ArchiveMetrics)) {
    if let Some(metrics) = METRICS.get() {
        f(metrics);
    }
}

pub fn inc_messages(n: u64) {
    with_metrics(|m| m.messages_saved.inc_by(n));
}

pub fn inc_messages_deleted(n: u64) {
    with_metrics(|m| m.messages_deleted.inc_by(n));
}

pub fn inc_admin_events(n: u64) {
    with_metrics(|m| m.admin_events_saved.inc_by(n));
}

pub fn inc_media() {
    with_metrics(|m| m.media_downloaded.inc());
}

pub fn inc_stickers() {
    with_metrics(|m| m.stickers_downloaded.inc());
}

pub fn inc_peers() {
    with_metrics(|m| m.peers_fetched.inc());
}

pub fn inc_runs_finished(status: &str) {
    with_metrics(|m| m.runs_finished.with_label_values(&[status]).inc());
}

pub fn inc_active_runs() {
    with_metrics(|m| m.active_runs.inc());
}

pub fn dec_active_runs() {
    with_metrics(|m| m.active_runs.dec());
}

pub fn set_queue_depth(target: &str, subsystem: &str, depth: i64) {
    with_metrics(|m| m.queue_depth.with_label_values(&[target, subsystem]).set(depth));
}

pub fn observe_fetch(subsystem: &str, seconds: f64) {
    with_metrics(|m| m.fetch_seconds.with_label_values(&[subsystem]).observe(seconds));
}

/// Text exposition of every registered metric.
pub fn render() -> anyhow::Result<Vec<u8>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

#[cfg(feature = "cli")]
pub async fn get_metrics() -> impl IntoResponse {
    match render() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        inc_runs_finished("completed");
        set_queue_depth("chat:-42", "HistoryFetcher", 3);
        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("archive_runs_finished_total{status=\"completed\"}"));
        let depth = text
            .lines()
            .find(|l| l.starts_with("archive_queue_depth{") && l.contains("target=\"chat:-42\""))
            .unwrap();
        assert!(depth.contains("subsystem=\"HistoryFetcher\""));
        assert!(depth.ends_with(" 3"));
    }
}
