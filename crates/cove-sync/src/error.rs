use thiserror::Error;

/// Failures produced by a [`ChatBackend`](crate::backend::ChatBackend)
/// implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The call never reached the backend or the connection dropped
    /// mid-flight. Recoverable; the feed adapter reconnects on its own.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The backend received the call and refused it.
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Failures surfaced by coordinator operations. Nothing here is fatal:
/// a rejected write is rolled back before the error is returned, and
/// transport loss degrades to a stale-but-consistent local view.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active conversation scope")]
    NoActiveScope,

    /// The backend refused the write; the optimistic update has already
    /// been rolled back.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl From<BackendError> for SyncError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(reason) => SyncError::WriteRejected(reason),
            BackendError::Transport(reason) => SyncError::Transport(reason),
        }
    }
}
