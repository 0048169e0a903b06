//! Broker error types.

use thiserror::Error;

use grendel_core::topic::TopicError;
use grendel_storage::StorageError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The operation is not permitted for this user. Whether the caller
    /// drops silently, NACKs, or disconnects is policy, not error shape.
    #[error("not authorized: {op} on `{topic}` for user `{username}`")]
    Unauthorized {
        op: &'static str,
        username: String,
        topic: String,
    },

    /// CONNECT refused: bad credentials, disabled user, or anonymous
    /// access not permitted.
    #[error("authentication failed for `{0}`")]
    AuthenticationFailed(String),

    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No session is known for the client.
    #[error("unknown client `{0}`")]
    UnknownClient(String),
}
