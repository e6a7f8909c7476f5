use thiserror::Error;

/// Everything that can go wrong in the engine, by recovery class.
///
/// All variants flow through the same error-observer channel so the UI can
/// react uniformly; none of them is ever allowed to escape a socket callback.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Socket close/error. Recovered via backoff retry; surfaced only once
    /// the attempt cap is exhausted.
    #[error("connection lost after {attempts} attempts: {reason}")]
    Connectivity { attempts: u32, reason: String },

    /// Missing or rejected token. Fatal to the session, never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed or undecodable frame. Logged and dropped.
    #[error("malformed frame: {0}")]
    Protocol(String),

    /// Server-sent error event. The connection stays open.
    #[error("server error: {0}")]
    Application(String),

    /// Attachment transfer failure. The owning message reverts to Failed.
    #[error("attachment upload failed: {0}")]
    Upload(String),
}
