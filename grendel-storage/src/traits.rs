//! Store contracts.
//!
//! Every trait here is a suspension point for the broker core: in-memory
//! backends resolve immediately, relational backends hop through the
//! blocking pool. Iteration uses push-style visitors (`FnMut(..) -> bool`,
//! return `false` to stop) so large result sets never materialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use grendel_core::BrokerMessage;

use crate::types::{
    AclRule, AggFunc, AggregatedHistory, ArchiveGroup, ArchivedMessage, DeviceConfig,
    MetricKind, MetricsSample, PurgeResult, SessionRecord, Subscription, TimeWindow, User,
};
use crate::Result;

/// Visitor over retained or queued messages. Return `false` to stop
/// (retained iteration) or to leave a queued message in place (dequeue).
pub type MessageVisitor<'a> = &'a mut (dyn FnMut(BrokerMessage) -> bool + Send);

/// Visitor over topic names.
pub type TopicVisitor<'a> = &'a mut (dyn FnMut(String) -> bool + Send);

/// Visitor over subscriptions.
pub type SubscriptionVisitor<'a> = &'a mut (dyn FnMut(Subscription) -> bool + Send);

/// Visitor over client identifiers.
pub type ClientVisitor<'a> = &'a mut (dyn FnMut(String) -> bool + Send);

/// Visitor over session rows.
pub type SessionVisitor<'a> = &'a mut (dyn FnMut(SessionRecord) -> bool + Send);

/// Retained-message store: one row per topic holding the last retained
/// message, with wildcard lookup.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Exact-topic lookup.
    async fn get(&self, topic: &str) -> Result<Option<BrokerMessage>>;

    /// Upsert by topic; idempotent per topic.
    async fn put_all(&self, messages: Vec<BrokerMessage>) -> Result<()>;

    /// Remove the retained entries for the given topics.
    async fn del_all(&self, topics: Vec<String>) -> Result<()>;

    /// Invoke the visitor for each retained message whose topic matches
    /// the filter, until it returns `false`.
    async fn find_matching_messages(&self, filter: &str, visitor: MessageVisitor<'_>)
        -> Result<()>;

    /// Enumerate the distinct topic levels visible at the pattern's depth.
    async fn find_matching_topics(&self, pattern: &str, visitor: TopicVisitor<'_>) -> Result<()>;

    /// Admin search: topics whose name matches a `*` glob.
    async fn find_topics_by_name(
        &self,
        glob: &str,
        ignore_case: bool,
        namespace: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Admin search: topics whose JSON payload field equals a value.
    async fn find_topics_by_config(
        &self,
        field: &str,
        value: &str,
        ignore_case: bool,
        namespace: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Delete retained entries older than the given instant.
    async fn purge_old_messages(&self, older_than: DateTime<Utc>) -> Result<PurgeResult>;
}

/// Append-only time-indexed archive of published messages.
#[async_trait]
pub trait MessageArchive: Send + Sync {
    /// Batch append; idempotent on `(topic, time)`.
    async fn add_history(&self, messages: Vec<BrokerMessage>) -> Result<()>;

    /// Time-descending history for a topic or filter. A trailing `#` is
    /// applied as a prefix match where possible and an exact filter check
    /// always runs on the result.
    async fn get_history(
        &self,
        topic: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<ArchivedMessage>>;

    /// Bucketed aggregation over a set of topics: one column per
    /// (topic, field, func), rows ascending by bucket start.
    async fn get_aggregated_history(
        &self,
        topics: Vec<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_minutes: u32,
        agg_funcs: Vec<AggFunc>,
        json_fields: Vec<String>,
    ) -> Result<AggregatedHistory>;

    async fn purge_old_messages(&self, older_than: DateTime<Utc>) -> Result<PurgeResult>;

    /// Drop the backing table entirely.
    async fn drop_storage(&self) -> Result<()>;

    async fn table_exists(&self) -> Result<bool>;

    /// Idempotent table/index creation.
    async fn create_table(&self) -> Result<()>;
}

/// Session rows, subscriptions, and per-client offline queues.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert the session row; refreshes `last_update`.
    async fn set_client(
        &self,
        client_id: &str,
        node_id: &str,
        clean_session: bool,
        connected: bool,
        info: serde_json::Value,
    ) -> Result<()>;

    async fn set_connected(&self, client_id: &str, connected: bool) -> Result<()>;

    async fn is_connected(&self, client_id: &str) -> Result<bool>;

    async fn is_present(&self, client_id: &str) -> Result<bool>;

    async fn set_last_will(&self, client_id: &str, will: Option<BrokerMessage>) -> Result<()>;

    async fn get_session(&self, client_id: &str) -> Result<Option<SessionRecord>>;

    async fn add_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()>;

    async fn del_subscriptions(&self, subscriptions: Vec<Subscription>) -> Result<()>;

    /// Get the persisted subscriptions of one client.
    async fn get_subscriptions(&self, client_id: &str) -> Result<Vec<Subscription>>;

    /// Delete a client atomically: subscriptions, then queued messages,
    /// then the session row, in one transaction. The visitor sees each
    /// subscription before removal so the topic tree can detach.
    async fn del_client(&self, client_id: &str, visitor: SubscriptionVisitor<'_>) -> Result<()>;

    /// Persist each message once plus one `(client, message_uuid)` mapping
    /// per recipient. Duplicate mappings are no-ops.
    async fn enqueue_messages(&self, messages: Vec<(BrokerMessage, Vec<String>)>) -> Result<()>;

    /// Yield the client's queued messages in insertion order. A `true`
    /// return acknowledges (removes the mapping); `false` retains it and
    /// stops the drain.
    async fn dequeue_messages(&self, client_id: &str, visitor: MessageVisitor<'_>) -> Result<()>;

    /// Remove specific queued-message mappings.
    async fn remove_messages(&self, messages: Vec<(String, Uuid)>) -> Result<()>;

    /// Drop all queued messages for the client.
    async fn purge_queued_messages(&self, client_id: &str) -> Result<()>;

    /// Drop session rows (and their state) for disconnected clients.
    async fn purge_sessions(&self) -> Result<u64>;

    async fn count_queued_messages(&self) -> Result<u64>;

    async fn count_queued_messages_for_client(&self, client_id: &str) -> Result<u64>;

    async fn iterate_subscriptions(&self, visitor: SubscriptionVisitor<'_>) -> Result<()>;

    async fn iterate_offline_clients(&self, visitor: ClientVisitor<'_>) -> Result<()>;

    async fn iterate_node_clients(&self, node_id: &str, visitor: ClientVisitor<'_>) -> Result<()>;

    async fn iterate_all_sessions(&self, visitor: SessionVisitor<'_>) -> Result<()>;
}

/// Users and ACL rules.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: User) -> Result<()>;

    async fn get_user(&self, username: &str) -> Result<Option<User>>;

    async fn update_user(&self, user: User) -> Result<()>;

    /// Deletes the user's ACL rules transitively.
    async fn delete_user(&self, username: &str) -> Result<()>;

    async fn list_users(&self) -> Result<Vec<User>>;

    /// Returns the user when it exists, is enabled, and the password
    /// verifies against the stored adaptive hash.
    async fn validate_credentials(&self, username: &str, password: &str) -> Result<Option<User>>;

    /// Returns the rule with its store-generated id.
    async fn create_acl_rule(&self, rule: AclRule) -> Result<AclRule>;

    async fn update_acl_rule(&self, rule: AclRule) -> Result<()>;

    async fn delete_acl_rule(&self, id: i64) -> Result<()>;

    async fn list_acl_rules(&self, username: Option<&str>) -> Result<Vec<AclRule>>;

    /// Cache warm-up: everything in one round trip.
    async fn load_all_users_and_acls(&self) -> Result<(Vec<User>, Vec<AclRule>)>;
}

/// Archive-group policies. Mutations are serialized; readers only ever
/// see complete groups.
#[async_trait]
pub trait ArchiveGroupStore: Send + Sync {
    /// Seed the `Default` group (filter `#`) if missing.
    async fn ensure_default_group(&self) -> Result<()>;

    async fn upsert_group(&self, group: ArchiveGroup) -> Result<()>;

    async fn get_group(&self, name: &str) -> Result<Option<ArchiveGroup>>;

    async fn delete_group(&self, name: &str) -> Result<()>;

    async fn list_groups(&self) -> Result<Vec<ArchiveGroup>>;
}

/// Time-series of broker/session/client counters.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Upsert by `(timestamp, kind, identifier)`.
    async fn upsert_sample(&self, sample: MetricsSample) -> Result<()>;

    /// Most recent sample inside the window.
    async fn latest_sample(
        &self,
        kind: MetricKind,
        identifier: &str,
        window: TimeWindow,
    ) -> Result<Option<MetricsSample>>;

    /// Samples inside the window, newest first, up to `limit`.
    async fn sample_history(
        &self,
        kind: MetricKind,
        identifier: &str,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<MetricsSample>>;

    async fn purge_old_samples(&self, older_than: DateTime<Utc>) -> Result<PurgeResult>;
}

/// Opaque device configurations for the admin interface.
#[async_trait]
pub trait DeviceConfigStore: Send + Sync {
    async fn upsert_device(&self, device: DeviceConfig) -> Result<()>;

    async fn get_device(&self, name: &str) -> Result<Option<DeviceConfig>>;

    async fn delete_device(&self, name: &str) -> Result<()>;

    async fn list_devices(&self, namespace: Option<&str>, node_id: Option<&str>)
        -> Result<Vec<DeviceConfig>>;
}
