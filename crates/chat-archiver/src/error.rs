//! Error taxonomy for the archiver.
//!
//! Orchestration code passes `anyhow::Error` around; the typed errors below are
//! recovered with `downcast_ref` wherever the kind of failure changes what the
//! engine does next (retry, skip, or fail the run).

use thiserror::Error;

/// Errors surfaced by a [`crate::protocol::ProtocolClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("transient protocol error: {0}")]
    Transient(String),
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("fatal protocol error: {0}")]
    Fatal(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_) | ClientError::RateLimited(_))
    }
}

/// Fatal conditions raised by the engine itself.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("migration {migration_id} ({migration_name}) in {database} was started but never completed")]
    MigrationIncomplete {
        database: String,
        migration_id: i64,
        migration_name: String,
    },
    #[error("migration {migration_id} ({migration_name}) in {database} was applied from different sql")]
    MigrationChecksumMismatch {
        database: String,
        migration_id: i64,
        migration_name: String,
    },
    #[error("archive run {0} is already finished and cannot be modified")]
    RunFinished(String),
    #[error("archive run {0} does not exist")]
    RunNotFound(String),
    #[error("giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("unknown subsystem name: {0}")]
    UnknownSubsystem(String),
    #[error("invalid queue entry {entry_id}: {reason}")]
    InvalidQueueEntry { entry_id: i64, reason: String },
    #[error("invalid target selector: {0}")]
    InvalidTarget(String),
}

/// Whether an error is worth retrying at the fetcher boundary.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(client_err) = err.downcast_ref::<ClientError>() {
        return client_err.is_transient();
    }
    if let Some(sqlite_err) = err.downcast_ref::<rusqlite::Error>() {
        return matches!(
            sqlite_err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
        );
    }
    false
}

/// Suggested wait before retrying, when the remote end told us.
pub fn retry_after(err: &anyhow::Error) -> Option<std::time::Duration> {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::RateLimited(secs)) => Some(std::time::Duration::from_secs(*secs)),
        _ => None,
    }
}
