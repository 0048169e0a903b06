//! Core types for the Grendel MQTT broker.
//!
//! This crate holds the vocabulary shared by the storage layer and the
//! broker core: topic names and filters, the internal message record,
//! QoS levels, and the human-readable duration grammar used by archive
//! retention settings.

pub mod duration;
pub mod message;
pub mod qos;
pub mod topic;

pub use message::BrokerMessage;
pub use qos::QoS;
