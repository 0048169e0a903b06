//! Storage abstraction layer for the Grendel MQTT broker.
//!
//! This crate defines the contracts every persistent concern of the broker
//! core goes through: retained messages, the message archive, sessions and
//! offline queues, users and ACL rules, archive-group policies, metrics
//! samples, and opaque device configurations. Two backends are provided: a
//! document-style in-memory store and a relational SQLite store.
//!
//! All operations return [`Result`]; the error taxonomy distinguishes
//! transient failures (retryable by callers for idempotent operations)
//! from permanent ones, bad input, and missing rows. Store writes are
//! idempotent: upserts, `ON CONFLICT DO NOTHING`, or transactions.

mod aggregate;
mod glob;
pub mod memory;
pub mod password;
pub mod traits;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use thiserror::Error;

pub use traits::{
    ArchiveGroupStore, DeviceConfigStore, MessageArchive, MessageStore, MetricsStore,
    SessionStore, UserStore,
};
pub use types::{
    AclRule, AggFunc, AggregatedHistory, ArchiveGroup, ArchivePayload, ArchivedMessage,
    DeviceConfig, MetricKind, MetricsSample, PayloadFormat, PurgeResult, SessionRecord,
    StoreKind, Subscription, TimeWindow, User,
};

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The addressed row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection lost, timeout, pool exhaustion. Retryable for
    /// idempotent operations.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Schema or constraint violation. Not retried.
    #[error("storage operation failed: {0}")]
    Permanent(String),

    /// Rejected before touching the backend: malformed topic, bad name,
    /// invalid window.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StorageError {
    /// Whether a caller may retry the failed operation (idempotent
    /// operations only).
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Combined trait for the singleton broker stores (retained stores and
/// archives are per-instance and obtained from the backend separately).
pub trait BrokerStore:
    SessionStore + UserStore + ArchiveGroupStore + MetricsStore + DeviceConfigStore
{
}

impl<T> BrokerStore for T where
    T: SessionStore + UserStore + ArchiveGroupStore + MetricsStore + DeviceConfigStore
{
}
