// chat-archiver/crates/chat-archiver/src/main.rs

#[cfg(feature = "cli")]
use std::path::PathBuf;
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
use chat_archiver::{
    config::{ArchiveSettings, Config},
    metrics,
    protocol::replay::ReplayClient,
    telemetry::init_tracing,
    Archiver, RunControl, RunOutcome, Target,
};
#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use tracing::{error, info, warn};

/// Archive conversations from a recorded protocol dump into a local store.
#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "chat-archiver", version)]
struct Args {
    /// Archive only this target (`chat:<id>` or `user:<id>`).
    #[arg(long)]
    target: Option<Target>,

    /// Replay dump that stands in for the messaging service.
    #[arg(long)]
    source: PathBuf,

    /// Store root, overrides ARCHIVE_STORE_DIR.
    #[arg(long)]
    store: Option<PathBuf>,

    /// Settings file, overrides ARCHIVE_SETTINGS.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();
    metrics::init_metrics()?;

    let args = Args::parse();
    let mut cfg = Config::from_env()?;
    if let Some(store) = args.store {
        cfg.store_root = store;
    }
    if let Some(settings) = args.settings {
        cfg.settings_path = settings;
    }
    cfg.print_config();

    let settings = ArchiveSettings::load(&cfg.settings_path)?;
    let client = Arc::new(ReplayClient::from_path(&args.source)?);
    let control = Arc::new(RunControl::new());

    // first Ctrl-C stops gracefully, the second aborts
    {
        let control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing queued work (press again to abort)");
                control.request_stop();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                control.request_abort();
            }
        });
    }

    if let Some(port) = cfg.metrics_port {
        let app = axum::Router::new().route("/metrics", axum::routing::get(metrics::get_metrics));
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Serving metrics on port {}", port);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    let archiver = Archiver::open(client, cfg, settings, control)?;
    let outcomes = archiver.run(args.target).await?;

    let mut failed = 0;
    for (target, outcome) in &outcomes {
        match outcome {
            RunOutcome::Failed(reason) => {
                failed += 1;
                error!("{}: failed: {}", target, reason);
            }
            other => info!("{}: {}", target, other.status()),
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} archive runs failed", failed, outcomes.len());
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
