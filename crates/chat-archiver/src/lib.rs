// chat-archiver/crates/chat-archiver/src/lib.rs

pub mod archiver;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetchers;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod run_manager;
pub mod run_record;
pub mod store;
pub mod target;
pub mod telemetry;

// Public API exports
pub use archiver::Archiver;
pub use config::{ArchiveSettings, BehaviourConfig, Config};
pub use error::{ArchiveError, ClientError};
pub use fetchers::RunControl;
pub use protocol::{ProtocolClient, RawObject};
pub use run_manager::{ArchiveRunManager, RunOutcome};
pub use run_record::{ArchiveRun, RunPhase};
pub use target::{Target, TargetType};
