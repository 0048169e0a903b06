//! Broker core for Grendel.
//!
//! The front-end (wire protocol, TLS, admin API) hands decoded operations
//! to two entry points: the [`session::SessionManager`] for connection
//! lifecycle and the [`router::Router`] for publish/subscribe traffic.
//! Everything below them — topic tree, ACL cache, retained store, offline
//! queues, archive groups, metrics — is owned here.

pub mod acl;
pub mod archive;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod metrics;
pub mod router;
pub mod session;
pub mod topic_tree;

pub use config::BrokerConfig;
pub use error::BrokerError;

/// A specialized `Result` type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
